//! The File-transfer Status Area (FSA).
//!
//! One fixed-layout record per configured host, memory-mapped into the
//! dispatcher and every sender. The mapping is published through a tiny
//! id file: readers take a lock on byte 0 of the id file, read the
//! current id and map `fsa.<id>`. A publisher writes a complete new
//! mapping, renames it into place and bumps the id under an exclusive
//! lock, so attached processes detect staleness by comparing ids.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::mem::offset_of;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::thread::sleep;
use std::time::Duration;

use memmap2::MmapMut;

use petrel_core::types::host_status;
use petrel_core::{
    ConnectStatus, WorkDir, MAX_FILENAME_LENGTH, MAX_HOST_ALIAS_LENGTH, MAX_MSG_NAME_LENGTH,
    MAX_NO_PARALLEL_JOBS, MAX_PROXY_NAME_LENGTH, MAX_REAL_HOSTNAME_LENGTH,
};

use crate::region::{lock_region_r, lock_region_w, RegionGuard};
use crate::{Result, StatusError, WORD_OFFSET};

/// Attach retry bounds. The id file can be momentarily absent while the
/// dispatcher republishes, the data file while it renames into place.
const ID_FILE_RETRIES: u32 = 12;
const ID_FILE_RETRY_DELAY: Duration = Duration::from_millis(800);
const DATA_FILE_RETRIES: u32 = 8;
const DATA_FILE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Per-slot transfer status, written by the sender owning the slot and
/// read by everyone.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct JobStatus {
    pub connect_status: u8,
    /// Out-of-band mailbox for burst hand-off. Cell `[1]` is the
    /// transition byte (zero while the sender waits), cell `[2]` is the
    /// give-up flag; a delivered message name fills the whole array.
    pub unique_name: [u8; MAX_MSG_NAME_LENGTH],
    pub error_file: u8,
    pub job_id: u32,
    pub no_of_files: i32,
    pub no_of_files_done: i32,
    pub file_size: i64,
    pub file_size_done: i64,
    pub file_size_in_use: i64,
    pub file_size_in_use_done: i64,
    pub bytes_send: u64,
    pub burst_counter: u32,
    pub file_name_in_use: [u8; MAX_FILENAME_LENGTH],
}

impl JobStatus {
    pub fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }

    pub fn connect_status(&self) -> ConnectStatus {
        ConnectStatus::from_u8(self.connect_status)
    }

    pub fn set_connect_status(&mut self, status: ConnectStatus) {
        self.connect_status = status as u8;
    }

    pub fn file_name_in_use(&self) -> &str {
        bytes_as_str(&self.file_name_in_use)
    }

    pub fn set_file_name_in_use(&mut self, name: &str) {
        copy_str(&mut self.file_name_in_use, name);
    }

    pub fn unique_name(&self) -> &str {
        bytes_as_str(&self.unique_name)
    }

    pub fn set_unique_name(&mut self, name: &str) {
        copy_str(&mut self.unique_name, name);
    }

    /// Arm the mailbox before asking the dispatcher for more work.
    pub fn mailbox_arm(&mut self) {
        self.unique_name[1] = 0;
        self.unique_name[2] = 4;
        self.error_file = 0;
    }

    /// True once the dispatcher delivered a new message name.
    pub fn mailbox_delivered(&self) -> bool {
        self.unique_name[1] != 0 && self.unique_name[0] != 0
    }

    /// Mark that the sender stopped waiting; the dispatcher must not
    /// hand work to this slot anymore.
    pub fn mailbox_give_up(&mut self) {
        self.unique_name[2] = 1;
    }

    pub fn mailbox_gave_up(&self) -> bool {
        self.unique_name[2] == 1
    }
}

/// One host record of the FSA.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct HostRecord {
    pub host_alias: [u8; MAX_HOST_ALIAS_LENGTH + 1],
    pub real_hostname: [[u8; MAX_REAL_HOSTNAME_LENGTH]; 2],
    pub host_toggle: u8,
    pub proxy_name: [u8; MAX_PROXY_NAME_LENGTH],
    pub allowed_transfers: i32,
    pub max_errors: i32,
    pub retry_interval: i32,
    pub block_size: i32,
    pub successful_retries: i32,
    pub file_size_offset: i8,
    pub transfer_timeout: i64,
    pub number_of_no_bursts: u8,
    pub debug: u8,
    pub host_status: u32,
    pub special_flag: u32,
    pub error_counter: i32,
    pub total_file_counter: i32,
    pub total_file_size: i64,
    pub bytes_send: u64,
    pub file_counter_done: u32,
    pub connections: u32,
    pub active_transfers: i32,
    pub jobs_queued: i32,
    pub job_status: [JobStatus; MAX_NO_PARALLEL_JOBS],
}

impl HostRecord {
    pub fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }

    pub fn host_alias(&self) -> &str {
        bytes_as_str(&self.host_alias)
    }

    pub fn set_host_alias(&mut self, alias: &str) {
        copy_str(&mut self.host_alias, alias);
    }

    /// The real host name to connect to, honouring the toggle position.
    pub fn active_hostname(&self) -> &str {
        let idx = if self.host_toggle <= 1 { 0 } else { 1 };
        let name = bytes_as_str(&self.real_hostname[idx]);
        if name.is_empty() {
            bytes_as_str(&self.real_hostname[0])
        } else {
            name
        }
    }

    pub fn set_real_hostname(&mut self, index: usize, name: &str) {
        copy_str(&mut self.real_hostname[index], name);
    }

    pub fn proxy_name(&self) -> &str {
        bytes_as_str(&self.proxy_name)
    }

    /// Whether the slot may carry burst continuations. The last
    /// `number_of_no_bursts` of the allowed slots are reserved as
    /// plain one-job connections that always hang up when done.
    pub fn slot_may_burst(&self, slot: usize) -> bool {
        let allowed = self.allowed_transfers.max(0) as usize;
        slot < allowed.saturating_sub(self.number_of_no_bursts as usize)
    }
}

fn bytes_as_str(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end]).unwrap_or("")
}

fn copy_str(dst: &mut [u8], src: &str) {
    dst.fill(0);
    let n = src.len().min(dst.len() - 1);
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
}

fn read_id_locked(id_file: &mut File) -> Result<i32> {
    let _guard = lock_region_w(id_file.as_raw_fd(), 0, 1)?;
    id_file.seek(SeekFrom::Start(0))?;
    let mut buf = [0u8; 4];
    id_file.read_exact(&mut buf)?;
    Ok(i32::from_ne_bytes(buf))
}

/// A live attachment to the current FSA mapping.
pub struct FsaHandle {
    work_dir: WorkDir,
    id: i32,
    file: File,
    map: MmapMut,
}

impl FsaHandle {
    /// Attach to the published FSA, retrying while the id or data file
    /// is momentarily absent. Fails once the retry bounds are exceeded.
    pub fn attach(work_dir: &WorkDir) -> Result<Self> {
        loop {
            let id = Self::wait_for_id(work_dir)?;
            let (file, map) = Self::map_data(work_dir, id)?;
            let handle = Self {
                work_dir: work_dir.clone(),
                id,
                file,
                map,
            };
            if handle.no_of_hosts() > 0 {
                return Ok(handle);
            }
            // A publisher is mid-swap; start over.
            sleep(ID_FILE_RETRY_DELAY);
        }
    }

    fn wait_for_id(work_dir: &WorkDir) -> Result<i32> {
        let id_path = work_dir.fsa_id_file();
        let mut attempts = 0;
        let mut id_file = loop {
            match OpenOptions::new().read(true).write(true).open(&id_path) {
                Ok(f) => break f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    attempts += 1;
                    if attempts > ID_FILE_RETRIES {
                        return Err(StatusError::Status(format!(
                            "status area id file {} never appeared",
                            id_path.display()
                        )));
                    }
                    sleep(ID_FILE_RETRY_DELAY);
                }
                Err(e) => return Err(e.into()),
            }
        };
        read_id_locked(&mut id_file)
    }

    fn map_data(work_dir: &WorkDir, id: i32) -> Result<(File, MmapMut)> {
        let data_path = work_dir.fsa_stat_file(id);
        let mut attempts = 0;
        let file = loop {
            match OpenOptions::new().read(true).write(true).open(&data_path) {
                Ok(f) => break f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    attempts += 1;
                    if attempts > DATA_FILE_RETRIES {
                        return Err(StatusError::Status(format!(
                            "status area data file {} never appeared",
                            data_path.display()
                        )));
                    }
                    tracing::warn!(file = %data_path.display(), "status area data file missing, retrying");
                    sleep(DATA_FILE_RETRY_DELAY);
                }
                Err(e) => return Err(e.into()),
            }
        };
        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| StatusError::Status(format!("failed to map {}: {e}", data_path.display())))?;
        if map.len() < WORD_OFFSET {
            return Err(StatusError::Status(format!(
                "status area {} truncated",
                data_path.display()
            )));
        }
        Ok((file, map))
    }

    /// Check whether the mapping went stale (the published id changed
    /// or the host count dropped) and remap if so. After a `true`
    /// return, callers must re-resolve their host index by alias.
    pub fn check_stale(&mut self) -> Result<bool> {
        let current = Self::wait_for_id(&self.work_dir)?;
        if current == self.id && self.no_of_hosts() > 0 {
            return Ok(false);
        }
        let fresh = Self::attach(&self.work_dir)?;
        *self = fresh;
        Ok(true)
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn no_of_hosts(&self) -> i32 {
        i32::from_ne_bytes(self.map[0..4].try_into().unwrap())
    }

    fn record_offset(index: usize) -> usize {
        WORD_OFFSET + index * size_of::<HostRecord>()
    }

    pub fn host(&self, index: usize) -> &HostRecord {
        assert!(index < self.no_of_hosts().max(0) as usize);
        unsafe { &*self.map.as_ptr().add(Self::record_offset(index)).cast::<HostRecord>() }
    }

    pub fn host_mut(&mut self, index: usize) -> &mut HostRecord {
        assert!(index < self.no_of_hosts().max(0) as usize);
        unsafe {
            &mut *self
                .map
                .as_mut_ptr()
                .add(Self::record_offset(index))
                .cast::<HostRecord>()
        }
    }

    /// Find a host by alias. Indices are only valid until the next
    /// `check_stale() == true`.
    pub fn host_position(&self, alias: &str) -> Option<usize> {
        (0..self.no_of_hosts().max(0) as usize).find(|&i| self.host(i).host_alias() == alias)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &HostRecord> {
        (0..self.no_of_hosts().max(0) as usize).map(|i| self.host(i))
    }

    // ---- locking -------------------------------------------------------

    /// Shared lock over the whole host record, held while iterating its
    /// slots so the record cannot be swapped out underneath.
    pub fn lock_host(&self, index: usize) -> Result<RegionGuard> {
        Ok(lock_region_r(
            self.raw_fd(),
            Self::record_offset(index) as i64,
            size_of::<HostRecord>() as i64,
        )?)
    }

    fn lock_field(&self, index: usize, field_offset: usize, len: usize) -> Result<RegionGuard> {
        Ok(lock_region_w(
            self.raw_fd(),
            (Self::record_offset(index) + field_offset) as i64,
            len as i64,
        )?)
    }

    /// Exclusive lock rendezvous for the counter pair
    /// (`total_file_counter`, `total_file_size`) and the done counters.
    pub fn lock_counters(&self, index: usize) -> Result<RegionGuard> {
        self.lock_field(index, offset_of!(HostRecord, total_file_counter), size_of::<i32>())
    }

    pub fn lock_error_counter(&self, index: usize) -> Result<RegionGuard> {
        self.lock_field(index, offset_of!(HostRecord, error_counter), size_of::<i32>())
    }

    pub fn lock_connections(&self, index: usize) -> Result<RegionGuard> {
        self.lock_field(index, offset_of!(HostRecord, connections), size_of::<u32>())
    }

    /// Exclusive lock over a slot's `file_name_in_use`, held across the
    /// duplicate-in-flight scan and the claim that follows it.
    pub fn lock_name_in_use(&self, index: usize, slot: usize) -> Result<RegionGuard> {
        let field = offset_of!(HostRecord, job_status)
            + slot * size_of::<JobStatus>()
            + offset_of!(JobStatus, file_name_in_use);
        self.lock_field(index, field, MAX_FILENAME_LENGTH)
    }

    /// Exclusive lock over a slot's queue hand-off fields, taken by the
    /// dispatcher while filling the mailbox.
    pub fn lock_slot_queue(&self, index: usize, slot: usize) -> Result<RegionGuard> {
        let field =
            offset_of!(HostRecord, job_status) + slot * size_of::<JobStatus>() + offset_of!(JobStatus, job_id);
        self.lock_field(index, field, size_of::<u32>())
    }

    // ---- bookkeeping ---------------------------------------------------

    /// Per-file success bookkeeping: clear the in-use pair, bump the
    /// done counters and, under the counter lock, retire the file from
    /// the host totals. Counters are clamped so they can never go
    /// negative and the size is zeroed whenever the counter reaches
    /// zero.
    pub fn record_file_done(
        &mut self,
        index: usize,
        slot: usize,
        file_size: i64,
        bytes_sent: u64,
    ) -> Result<()> {
        {
            let record = self.host_mut(index);
            let js = &mut record.job_status[slot];
            js.file_name_in_use.fill(0);
            js.no_of_files_done += 1;
            js.file_size_in_use = 0;
            js.file_size_in_use_done = 0;
        }
        let _guard = self.lock_counters(index)?;
        let record = self.host_mut(index);
        record.total_file_counter -= 1;
        if record.total_file_counter < 0 {
            tracing::debug!(
                host = record.host_alias(),
                "total file counter went negative, correcting"
            );
            record.total_file_counter = 0;
        }
        record.total_file_size -= file_size;
        if record.total_file_size < 0
            || (record.total_file_counter == 0 && record.total_file_size > 0)
        {
            tracing::debug!(
                host = record.host_alias(),
                size = record.total_file_size,
                "total file size inconsistent, correcting"
            );
            record.total_file_size = 0;
        }
        record.file_counter_done += 1;
        record.bytes_send += bytes_sent;
        Ok(())
    }

    /// Retire a file from the totals without transferring it (used when
    /// another slot already has the same file in flight).
    pub fn retire_duplicate(&mut self, index: usize, slot: usize, file_size: i64) -> Result<()> {
        self.host_mut(index).job_status[slot].no_of_files_done += 1;
        let _guard = self.lock_counters(index)?;
        let record = self.host_mut(index);
        record.total_file_counter -= 1;
        if record.total_file_counter < 0 {
            record.total_file_counter = 0;
        }
        record.total_file_size -= file_size;
        if record.total_file_size < 0 || record.total_file_counter == 0 {
            record.total_file_size = 0;
        }
        Ok(())
    }

    /// The first-good-transfer ritual. Fires only when `error_counter`
    /// is above zero: resets it, demotes every other NOT_WORKING slot
    /// to DISCONNECT, clears the auto-pause bit and wakes the
    /// dispatcher through the supplied callback. Returns whether it
    /// fired.
    pub fn first_good_transfer(
        &mut self,
        index: usize,
        slot: usize,
        wake_dispatcher: impl FnOnce(),
    ) -> Result<bool> {
        if self.host(index).error_counter <= 0 {
            return Ok(false);
        }
        let guard = self.lock_error_counter(index)?;
        let record = self.host_mut(index);
        record.error_counter = 0;
        for j in 0..record.allowed_transfers.max(0) as usize {
            if j != slot
                && record.job_status[j].connect_status() == ConnectStatus::NotWorking
            {
                record.job_status[j].set_connect_status(ConnectStatus::Disconnect);
            }
        }
        drop(guard);

        wake_dispatcher();

        let record = self.host_mut(index);
        if record.host_status & host_status::AUTO_PAUSE_QUEUE != 0 {
            record.host_status &= !host_status::AUTO_PAUSE_QUEUE;
            tracing::info!(
                host = record.host_alias(),
                "restarting input queue stopped after repeated errors"
            );
        }
        Ok(true)
    }

    /// Reset a slot on process exit, leaving no trace of the dead
    /// transfer.
    pub fn reset_slot(&mut self, index: usize, slot: usize) {
        let js = &mut self.host_mut(index).job_status[slot];
        js.set_connect_status(ConnectStatus::NotWorking);
        js.file_name_in_use.fill(0);
        js.file_size_in_use = 0;
        js.file_size_in_use_done = 0;
        js.no_of_files = 0;
        js.no_of_files_done = 0;
        js.file_size = 0;
        js.file_size_done = 0;
        js.bytes_send = 0;
    }
}

/// Publish a brand-new FSA mapping from a set of host records.
///
/// The data file is written complete under a temporary name and renamed
/// into place before the id is bumped, so attachers either see the old
/// mapping or the new one, never a partial file.
pub fn publish(work_dir: &WorkDir, records: &[HostRecord]) -> Result<i32> {
    let id_path = work_dir.fsa_id_file();
    let mut id_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&id_path)?;
    let guard = lock_region_w(id_file.as_raw_fd(), 0, 1)?;

    let old_id = {
        let mut buf = [0u8; 4];
        id_file.seek(SeekFrom::Start(0))?;
        match id_file.read_exact(&mut buf) {
            Ok(()) => i32::from_ne_bytes(buf),
            Err(_) => -1,
        }
    };
    let new_id = old_id.wrapping_add(1);

    let data_path = work_dir.fsa_stat_file(new_id);
    let tmp_path = data_path.with_extension("tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        let mut header = [0u8; WORD_OFFSET];
        header[0..4].copy_from_slice(&(records.len() as i32).to_ne_bytes());
        tmp.write_all(&header)?;
        for record in records {
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    (record as *const HostRecord).cast::<u8>(),
                    size_of::<HostRecord>(),
                )
            };
            tmp.write_all(bytes)?;
        }
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, &data_path)?;

    id_file.seek(SeekFrom::Start(0))?;
    id_file.write_all(&new_id.to_ne_bytes())?;
    id_file.sync_all()?;
    drop(guard);

    let old_path: Option<PathBuf> = (old_id >= 0).then(|| work_dir.fsa_stat_file(old_id));
    if let Some(old) = old_path {
        let _ = std::fs::remove_file(old);
    }
    Ok(new_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(alias: &str, allowed: i32) -> HostRecord {
        let mut r = HostRecord::zeroed();
        r.set_host_alias(alias);
        r.set_real_hostname(0, "srv.example");
        r.allowed_transfers = allowed;
        r.block_size = 1024;
        r.transfer_timeout = 60;
        r.file_size_offset = -1;
        r
    }

    fn publish_two(work_dir: &WorkDir) -> i32 {
        work_dir.create_all().unwrap();
        publish(work_dir, &[record("h1", 2), record("h2", 3)]).unwrap()
    }

    #[test]
    fn publish_and_attach() {
        let dir = tempfile::tempdir().unwrap();
        let wd = WorkDir::new(dir.path());
        publish_two(&wd);

        let fsa = FsaHandle::attach(&wd).unwrap();
        assert_eq!(fsa.no_of_hosts(), 2);
        assert_eq!(fsa.host_position("h2"), Some(1));
        assert_eq!(fsa.host(0).host_alias(), "h1");
        assert_eq!(fsa.host(0).active_hostname(), "srv.example");
    }

    #[test]
    fn stale_detection_after_republish() {
        let dir = tempfile::tempdir().unwrap();
        let wd = WorkDir::new(dir.path());
        publish_two(&wd);

        let mut fsa = FsaHandle::attach(&wd).unwrap();
        assert!(!fsa.check_stale().unwrap());

        publish(&wd, &[record("h3", 1)]).unwrap();
        assert!(fsa.check_stale().unwrap());
        assert_eq!(fsa.no_of_hosts(), 1);
        assert_eq!(fsa.host_position("h1"), None);
        assert_eq!(fsa.host_position("h3"), Some(0));
    }

    #[test]
    fn file_done_bookkeeping_clamps() {
        let dir = tempfile::tempdir().unwrap();
        let wd = WorkDir::new(dir.path());
        publish_two(&wd);

        let mut fsa = FsaHandle::attach(&wd).unwrap();
        {
            let h = fsa.host_mut(0);
            h.total_file_counter = 1;
            h.total_file_size = 4096;
            h.job_status[0].set_file_name_in_use("A");
        }
        fsa.record_file_done(0, 0, 4096, 4096).unwrap();
        let h = fsa.host(0);
        assert_eq!(h.total_file_counter, 0);
        assert_eq!(h.total_file_size, 0);
        assert_eq!(h.file_counter_done, 1);
        assert_eq!(h.bytes_send, 4096);
        assert_eq!(h.job_status[0].file_name_in_use(), "");
        assert_eq!(h.job_status[0].no_of_files_done, 1);

        // Retiring more files than counted must clamp, not wrap.
        fsa.record_file_done(0, 0, 100, 0).unwrap();
        let h = fsa.host(0);
        assert_eq!(h.total_file_counter, 0);
        assert_eq!(h.total_file_size, 0);
    }

    #[test]
    fn first_good_transfer_fires_once() {
        let dir = tempfile::tempdir().unwrap();
        let wd = WorkDir::new(dir.path());
        publish_two(&wd);

        let mut fsa = FsaHandle::attach(&wd).unwrap();
        {
            let h = fsa.host_mut(0);
            h.error_counter = 3;
            h.host_status |= host_status::AUTO_PAUSE_QUEUE;
            h.job_status[1].set_connect_status(ConnectStatus::NotWorking);
        }

        let mut woken = 0;
        let fired = fsa.first_good_transfer(0, 0, || woken += 1).unwrap();
        assert!(fired);
        assert_eq!(woken, 1);
        let h = fsa.host(0);
        assert_eq!(h.error_counter, 0);
        assert_eq!(h.host_status & host_status::AUTO_PAUSE_QUEUE, 0);
        assert_eq!(h.job_status[1].connect_status(), ConnectStatus::Disconnect);

        // error_counter is already zero, the ritual must not fire again.
        let fired = fsa.first_good_transfer(0, 0, || woken += 1).unwrap();
        assert!(!fired);
        assert_eq!(woken, 1);
    }

    #[test]
    fn no_burst_band_is_the_slot_tail() {
        let mut r = record("h1", 3);
        r.number_of_no_bursts = 1;
        assert!(r.slot_may_burst(0));
        assert!(r.slot_may_burst(1));
        assert!(!r.slot_may_burst(2));

        // Every slot reserved: nothing bursts.
        r.number_of_no_bursts = 3;
        assert!(!r.slot_may_burst(0));

        // No reservation: every slot bursts.
        r.number_of_no_bursts = 0;
        assert!(r.slot_may_burst(2));
        assert!(!r.slot_may_burst(3)); // beyond allowed_transfers
    }

    #[test]
    fn mailbox_protocol() {
        let mut js = JobStatus::zeroed();
        js.mailbox_arm();
        assert!(!js.mailbox_delivered());
        assert!(!js.mailbox_gave_up());

        js.set_unique_name("4a8_0_17");
        assert!(js.mailbox_delivered());
        assert_eq!(js.unique_name(), "4a8_0_17");

        let mut js = JobStatus::zeroed();
        js.mailbox_arm();
        js.mailbox_give_up();
        assert!(js.mailbox_gave_up());
    }
}
