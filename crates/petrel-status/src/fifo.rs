//! Named-pipe plumbing between dispatcher and senders.
//!
//! `sf.fin` carries pid-sized records: a positive pid means "this
//! sender is done", a negative pid means "this sender wants another job
//! on its open connection". `fd.wakeup` carries single bytes that only
//! mean "dispatcher, look again". All writers open read-write so a
//! write never fails just because no reader is attached yet.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use crate::Result;

/// Create the fifo if it does not exist yet. Racing creators are fine:
/// losing the race just means someone else made it.
pub fn ensure_fifo(path: &Path) -> Result<()> {
    match mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IWGRP) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(e) => Err(std::io::Error::from(e).into()),
    }
}

/// Open for both directions so opening never blocks and writes do not
/// die on a readerless pipe.
pub fn open_rw(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().read(true).write(true).open(path)?)
}

pub fn write_pid(fifo: &mut File, pid: i32) -> Result<()> {
    fifo.write_all(&pid.to_ne_bytes())?;
    Ok(())
}

/// Drain every complete pid record currently in the pipe without
/// blocking.
pub fn drain_pids(fifo: &mut File) -> Result<Vec<i32>> {
    set_nonblocking(fifo)?;
    let mut pids = Vec::new();
    let mut buf = [0u8; 4];
    loop {
        match fifo.read_exact(&mut buf) {
            Ok(()) => pids.push(i32::from_ne_bytes(buf)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(pids)
}

pub fn write_wakeup(fifo: &mut File) -> Result<()> {
    fifo.write_all(&[0u8])?;
    Ok(())
}

/// Swallow pending wakeup bytes; returns whether any were seen.
pub fn drain_wakeups(fifo: &mut File) -> Result<bool> {
    set_nonblocking(fifo)?;
    let mut seen = false;
    let mut buf = [0u8; 32];
    loop {
        match fifo.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => seen = true,
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(seen)
}

fn set_nonblocking(file: &File) -> Result<()> {
    use std::os::fd::AsRawFd;
    let flags = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Convenience for one-shot notifications: open, write one pid, close.
pub fn notify_pid(path: &Path, pid: i32) -> Result<()> {
    ensure_fifo(path)?;
    let mut fifo = open_rw(path)?;
    write_pid(&mut fifo, pid)
}

/// Convenience for one-shot wakeups: open, write one byte, close.
pub fn notify_wakeup(path: &Path) -> Result<()> {
    ensure_fifo(path)?;
    let mut fifo = open_rw(path)?;
    write_wakeup(&mut fifo)
}
