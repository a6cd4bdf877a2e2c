//! Byte-range advisory locks over mapped files.
//!
//! The lock offsets are the byte offsets of the fields they protect, so
//! two writers of different counters never contend and a whole-record
//! lock covers every field of that record.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg};

fn flock(l_type: i16, offset: i64, len: i64) -> libc::flock {
    libc::flock {
        l_type,
        l_whence: libc::SEEK_SET as i16,
        l_start: offset,
        l_len: len,
        l_pid: 0,
    }
}

fn set_lock_wait(fd: RawFd, l_type: i16, offset: i64, len: i64) -> io::Result<()> {
    let lock = flock(l_type, offset, len);
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    fcntl(borrowed, FcntlArg::F_SETLKW(&lock))
        .map(|_| ())
        .map_err(io::Error::from)
}

/// Exclusive lock over `len` bytes at `offset`, blocking until granted.
/// Released when the returned guard drops.
pub fn lock_region_w(fd: RawFd, offset: i64, len: i64) -> io::Result<RegionGuard> {
    set_lock_wait(fd, libc::F_WRLCK as i16, offset, len)?;
    Ok(RegionGuard { fd, offset, len })
}

/// Shared lock over `len` bytes at `offset`, blocking until granted.
pub fn lock_region_r(fd: RawFd, offset: i64, len: i64) -> io::Result<RegionGuard> {
    set_lock_wait(fd, libc::F_RDLCK as i16, offset, len)?;
    Ok(RegionGuard { fd, offset, len })
}

/// Holds a byte-range lock until dropped.
#[derive(Debug)]
pub struct RegionGuard {
    fd: RawFd,
    offset: i64,
    len: i64,
}

impl RegionGuard {
    pub fn offset(&self) -> i64 {
        self.offset
    }
}

impl Drop for RegionGuard {
    fn drop(&mut self) {
        let lock = flock(libc::F_UNLCK as i16, self.offset, self.len);
        let borrowed = unsafe { BorrowedFd::borrow_raw(self.fd) };
        if let Err(e) = fcntl(borrowed, FcntlArg::F_SETLK(&lock)) {
            tracing::warn!(offset = self.offset, "failed to unlock region: {}", e);
        }
    }
}

/// Lock the whole file (offset 0, length 0 means to EOF and beyond).
pub fn lock_file_w(file: &impl AsRawFd) -> io::Result<RegionGuard> {
    lock_region_w(file.as_raw_fd(), 0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn lock_and_release() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; 64]).unwrap();
        let fd = f.as_file().as_raw_fd();

        let g = lock_region_w(fd, 8, 4).unwrap();
        drop(g);
        // Relocking the same region after the guard dropped must succeed.
        let g2 = lock_region_w(fd, 8, 4).unwrap();
        drop(g2);
    }

    #[test]
    fn shared_locks_coexist() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; 64]).unwrap();
        let fd = f.as_file().as_raw_fd();

        let a = lock_region_r(fd, 0, 16).unwrap();
        let b = lock_region_r(fd, 0, 16).unwrap();
        drop(a);
        drop(b);
    }
}
