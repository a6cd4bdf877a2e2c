//! A file-backed, growable array of fixed-size records.
//!
//! Layout: a [`WORD_OFFSET`](crate::WORD_OFFSET) header (count word at
//! offset 0, sweep-deadline word at offset 8) followed by a flat array
//! of `T`. The file grows and shrinks in `step_size` record increments
//! so concurrent mappers only have to remap when a step boundary is
//! crossed.

use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::{Result, StatusError, WORD_OFFSET};

/// Marker for record types that may live in a shared mapping: plain
/// `#[repr(C)]` data with no padding-sensitive invariants.
///
/// # Safety
///
/// Implementors must be valid for any bit pattern and contain no
/// pointers or non-`'static` data.
pub unsafe trait MappedRecord: Copy + 'static {}

pub struct GrowableMap<T: MappedRecord> {
    path: PathBuf,
    file: File,
    map: MmapMut,
    step_size: usize,
    _marker: PhantomData<T>,
}

impl<T: MappedRecord> GrowableMap<T> {
    /// Open (creating if absent) the mapped array at `path`.
    ///
    /// A fresh file is sized to one step of records with a zeroed
    /// header, matching what every other process expects to map.
    pub fn attach(path: &Path, step_size: usize) -> Result<Self> {
        assert!(step_size > 0);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len() as usize;
        if len < WORD_OFFSET {
            let initial = WORD_OFFSET + step_size * size_of::<T>();
            file.set_len(initial as u64)?;
        }

        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|e| {
            StatusError::Status(format!("failed to map {}: {e}", path.display()))
        })?;

        let mut this = Self {
            path: path.to_path_buf(),
            file,
            map,
            step_size,
            _marker: PhantomData,
        };
        if this.count() < 0 {
            tracing::debug!(path = %this.path.display(), "negative record count, resetting");
            this.set_count(0);
        }
        Ok(this)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn count(&self) -> i32 {
        i32::from_ne_bytes(self.map[0..4].try_into().unwrap())
    }

    pub fn set_count(&mut self, count: i32) {
        self.map[0..4].copy_from_slice(&count.to_ne_bytes());
    }

    pub fn sweep_deadline(&self) -> i64 {
        i64::from_ne_bytes(self.map[8..16].try_into().unwrap())
    }

    pub fn set_sweep_deadline(&mut self, deadline: i64) {
        self.map[8..16].copy_from_slice(&deadline.to_ne_bytes());
    }

    fn capacity(&self) -> usize {
        (self.map.len() - WORD_OFFSET) / size_of::<T>()
    }

    pub fn as_slice(&self) -> &[T] {
        let n = self.count().max(0) as usize;
        let n = n.min(self.capacity());
        unsafe {
            std::slice::from_raw_parts(self.map.as_ptr().add(WORD_OFFSET).cast::<T>(), n)
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        let n = self.count().max(0) as usize;
        let n = n.min(self.capacity());
        unsafe {
            std::slice::from_raw_parts_mut(
                self.map.as_mut_ptr().add(WORD_OFFSET).cast::<T>(),
                n,
            )
        }
    }

    fn remap(&mut self, new_len: usize) -> Result<()> {
        self.file.set_len(new_len as u64)?;
        self.map = unsafe { MmapMut::map_mut(&self.file) }.map_err(|e| {
            StatusError::Status(format!("failed to remap {}: {e}", self.path.display()))
        })?;
        Ok(())
    }

    /// Append a record, growing the file by one step when the current
    /// capacity is exhausted.
    pub fn push(&mut self, value: T) -> Result<()> {
        let n = self.count().max(0) as usize;
        if n >= self.capacity() {
            let new_cap = ((n / self.step_size) + 1) * self.step_size;
            self.remap(WORD_OFFSET + new_cap * size_of::<T>())?;
        }
        unsafe {
            let ptr = self.map.as_mut_ptr().add(WORD_OFFSET).cast::<T>().add(n);
            ptr.write(value);
        }
        self.set_count(n as i32 + 1);
        Ok(())
    }

    /// Remove the record at `index` by moving everything behind it
    /// forward one place.
    pub fn remove(&mut self, index: usize) {
        let n = self.count().max(0) as usize;
        if index >= n {
            return;
        }
        let slice = self.as_mut_slice();
        slice.copy_within(index + 1..n, index);
        self.set_count(n as i32 - 1);
    }

    /// Shrink the file back to the smallest step multiple that holds
    /// the current records. Other mappers remap on their next attach.
    pub fn shrink_to_fit(&mut self) -> Result<()> {
        let n = self.count().max(0) as usize;
        let steps = if n == 0 { 1 } else { n.div_ceil(self.step_size) };
        let wanted = WORD_OFFSET + steps * self.step_size * size_of::<T>();
        if wanted != self.map.len() {
            self.remap(wanted)?;
        }
        Ok(())
    }
}
