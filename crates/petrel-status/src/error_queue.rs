//! Process-wide retry-suppression queue.
//!
//! When a job keeps failing, the dispatcher parks its job id here so
//! retries are not amplified while the host is known bad. The queue is
//! a small mapped array shared by dispatcher and senders; removing the
//! last entry for a host clears that host's ERROR_QUEUE_SET bit in the
//! status area.

use std::path::Path;

use petrel_core::types::host_status;
use petrel_core::WorkDir;

use crate::fsa::FsaHandle;
use crate::growable::{GrowableMap, MappedRecord};
use crate::region::lock_region_w;
use crate::Result;

const ERROR_QUEUE_STEP_SIZE: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct ErrorQueueEntry {
    pub job_id: u32,
    pub no_to_be_queued: u32,
    pub host_id: u32,
    pub special_flag: u32,
}

unsafe impl MappedRecord for ErrorQueueEntry {}

pub struct ErrorQueue {
    map: GrowableMap<ErrorQueueEntry>,
}

impl ErrorQueue {
    pub fn attach(work_dir: &WorkDir) -> Result<Self> {
        Self::attach_path(&work_dir.error_queue_file())
    }

    pub fn attach_path(path: &Path) -> Result<Self> {
        Ok(Self {
            map: GrowableMap::attach(path, ERROR_QUEUE_STEP_SIZE)?,
        })
    }

    pub fn len(&self) -> usize {
        self.map.count().max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, job_id: u32) -> bool {
        self.map.as_slice().iter().any(|e| e.job_id == job_id)
    }

    pub fn host_entries(&self, host_id: u32) -> usize {
        self.map.as_slice().iter().filter(|e| e.host_id == host_id).count()
    }

    /// Park a job. A job id appears at most once; re-adding bumps its
    /// queued count instead.
    pub fn add(&mut self, job_id: u32, host_id: u32) -> Result<()> {
        let _guard = lock_region_w(self.map.raw_fd(), 0, 1)?;
        if let Some(entry) = self
            .map
            .as_mut_slice()
            .iter_mut()
            .find(|e| e.job_id == job_id)
        {
            entry.no_to_be_queued += 1;
            return Ok(());
        }
        self.map.push(ErrorQueueEntry {
            job_id,
            no_to_be_queued: 1,
            host_id,
            special_flag: 0,
        })
    }

    /// Remove a job from the queue. When this was the host's last
    /// parked job, the host's ERROR_QUEUE_SET bit is cleared.
    pub fn remove(&mut self, job_id: u32, fsa: &mut FsaHandle) -> Result<bool> {
        let _guard = lock_region_w(self.map.raw_fd(), 0, 1)?;
        let Some(pos) = self.map.as_slice().iter().position(|e| e.job_id == job_id) else {
            return Ok(false);
        };
        let host_id = self.map.as_slice()[pos].host_id;
        self.map.remove(pos);

        if self.host_entries(host_id) == 0 {
            if let Some(idx) = (0..fsa.no_of_hosts().max(0) as usize)
                .find(|&i| host_key(fsa.host(i).host_alias()) == host_id)
            {
                let record = fsa.host_mut(idx);
                if record.host_status & host_status::ERROR_QUEUE_SET != 0 {
                    record.host_status &= !host_status::ERROR_QUEUE_SET;
                }
            }
        }
        Ok(true)
    }
}

/// Stable identifier for a host alias used as the queue's `host_id`.
pub fn host_key(alias: &str) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(alias.as_bytes());
    hasher.finalize()
}
