//! Duplicate detection over incoming files.
//!
//! Each job owns a small mapped array of `{crc, flag, timeout}` entries
//! under `files/incoming/.crc/<job_id>`. The flag records which input
//! space produced the checksum so a filename CRC never collides with a
//! content CRC of the same value. Expired entries are purged by a
//! forward-copy sweep that runs at most once per check-time bucket.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use petrel_core::WorkDir;

use crate::growable::{GrowableMap, MappedRecord};
use crate::region::lock_region_w;
use crate::Result;

const CRC_STEP_SIZE: usize = 10;

/// Sweep-bucket clamp in seconds.
pub const DUPCHECK_MIN_CHECK_TIME: i64 = 10;
pub const DUPCHECK_MAX_CHECK_TIME: i64 = 3600;

/// Which input space feeds the checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DupFlag {
    FilenameOnly = 1,
    FilenameAndSize = 2,
    NameNoSuffix = 4,
    FileContent = 8,
    FileContentAndName = 16,
}

#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct CrcEntry {
    pub crc: u32,
    pub flag: u32,
    pub timeout: i64,
}

unsafe impl MappedRecord for CrcEntry {}

pub struct DupStore {
    map: GrowableMap<CrcEntry>,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn basename(fullname: &Path) -> Option<&str> {
    fullname.file_name().and_then(|n| n.to_str())
}

fn checksum_of(fullname: &Path, size: i64, flag: DupFlag) -> std::io::Result<Option<u32>> {
    let mut hasher = crc32fast::Hasher::new();
    match flag {
        DupFlag::FilenameOnly => {
            let Some(name) = basename(fullname) else { return Ok(None) };
            hasher.update(name.as_bytes());
        }
        DupFlag::FilenameAndSize => {
            let Some(name) = basename(fullname) else { return Ok(None) };
            hasher.update(name.as_bytes());
            hasher.update(b" ");
            hasher.update(&size.to_ne_bytes());
        }
        DupFlag::NameNoSuffix => {
            let Some(name) = basename(fullname) else { return Ok(None) };
            let stem = match name.rfind('.') {
                Some(pos) => &name[..pos],
                None => name,
            };
            hasher.update(stem.as_bytes());
        }
        DupFlag::FileContent => {
            hash_file(&mut hasher, fullname)?;
        }
        DupFlag::FileContentAndName => {
            let Some(name) = basename(fullname) else { return Ok(None) };
            hasher.update(name.as_bytes());
            hash_file(&mut hasher, fullname)?;
        }
    }
    Ok(Some(hasher.finalize()))
}

fn hash_file(hasher: &mut crc32fast::Hasher, path: &Path) -> std::io::Result<()> {
    let mut file = File::open(path)?;
    let mut buf = [0u8; 4096];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(())
}

impl DupStore {
    pub fn attach(work_dir: &WorkDir, job_id: u32) -> Result<Self> {
        Self::attach_path(&work_dir.crc_file(job_id))
    }

    pub fn attach_path(path: &Path) -> Result<Self> {
        let mut map = GrowableMap::attach(path, CRC_STEP_SIZE)?;
        // A fresh store carries a zero deadline; give it a sane one so
        // the first sweep does not fire immediately on attach.
        let now = unix_now();
        let deadline = map.sweep_deadline();
        if deadline < 100_000 || deadline > now + DUPCHECK_MAX_CHECK_TIME {
            map.set_sweep_deadline(now);
        }
        Ok(Self { map })
    }

    pub fn len(&self) -> usize {
        self.map.count().max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check whether `fullname` was seen before within `timeout`
    /// seconds. A hit refreshes the entry's deadline; a miss inserts.
    pub fn is_duplicate(
        &mut self,
        fullname: &Path,
        size: i64,
        timeout: i64,
        flag: DupFlag,
    ) -> Result<bool> {
        self.check_at(fullname, size, timeout, flag, unix_now())
    }

    /// Forget an earlier sighting instead of inserting one.
    pub fn remove(&mut self, fullname: &Path, size: i64, flag: DupFlag) -> Result<()> {
        let Some(crc) = checksum_of(fullname, size, flag)? else {
            return Ok(());
        };
        let _guard = lock_region_w(self.map.raw_fd(), 0, 1)?;
        if let Some(pos) = self
            .map
            .as_slice()
            .iter()
            .position(|e| e.crc == crc && e.flag == flag as u32)
        {
            self.map.remove(pos);
        }
        Ok(())
    }

    fn check_at(
        &mut self,
        fullname: &Path,
        size: i64,
        timeout: i64,
        flag: DupFlag,
        now: i64,
    ) -> Result<bool> {
        let Some(crc) = checksum_of(fullname, size, flag)? else {
            tracing::warn!(path = %fullname.display(), "unable to derive a file name, not checked");
            return Ok(false);
        };
        if timeout <= 0 {
            return Ok(false);
        }

        let _guard = lock_region_w(self.map.raw_fd(), 0, 1)?;
        self.sweep(now, timeout);

        if let Some(entry) = self
            .map
            .as_mut_slice()
            .iter_mut()
            .find(|e| e.crc == crc && e.flag == flag as u32)
        {
            let live = now <= entry.timeout;
            entry.timeout = now + timeout;
            return Ok(live);
        }

        self.map.push(CrcEntry {
            crc,
            flag: flag as u32,
            timeout: now + timeout,
        })?;
        Ok(false)
    }

    /// Purge expired entries, at most once per check-time bucket. The
    /// bucket width is the job timeout clamped to the documented range,
    /// and the next deadline is rounded up to the following bucket
    /// boundary.
    fn sweep(&mut self, now: i64, timeout: i64) {
        if now <= self.map.sweep_deadline() {
            return;
        }
        let bucket = timeout.clamp(DUPCHECK_MIN_CHECK_TIME, DUPCHECK_MAX_CHECK_TIME);

        let mut i = 0;
        while i < self.len() {
            if self.map.as_slice()[i].timeout <= now {
                self.map.remove(i);
            } else {
                i += 1;
            }
        }
        self.map.set_sweep_deadline((now / bucket) * bucket + bucket);
    }
}
