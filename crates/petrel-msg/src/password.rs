//! The obfuscated password store.
//!
//! Passwords stripped out of recipient URLs live in one mapped file of
//! fixed records keyed by `user@host`. The stored bytes are shifted by
//! a per-position amount so a casual `strings` over the file shows
//! nothing; this is obfuscation, not encryption, exactly as strong as
//! the file permissions around it.

use std::path::Path;

use petrel_core::WorkDir;
use petrel_status::growable::MappedRecord;
use petrel_status::region::lock_region_r;
use petrel_status::GrowableMap;

use crate::Result;

const MAX_UH_NAME_LENGTH: usize = 80;
const MAX_PASSWORD_LENGTH: usize = 64;
const PWB_STEP_SIZE: usize = 8;

#[derive(Clone, Copy)]
#[repr(C)]
pub struct PasswordRecord {
    pub uh_name: [u8; MAX_UH_NAME_LENGTH],
    pub passwd: [u8; MAX_PASSWORD_LENGTH],
}

unsafe impl MappedRecord for PasswordRecord {}

/// Shift one password byte into its stored form. Even positions move
/// down by `24 - i`, odd positions by `11 - i`, wrapping.
fn obfuscate_byte(c: u8, i: usize) -> u8 {
    if i % 2 == 0 {
        c.wrapping_sub((24i32 - i as i32) as u8)
    } else {
        c.wrapping_sub((11i32 - i as i32) as u8)
    }
}

fn deobfuscate_byte(c: u8, i: usize) -> u8 {
    if i % 2 == 0 {
        c.wrapping_add((24i32 - i as i32) as u8)
    } else {
        c.wrapping_add((11i32 - i as i32) as u8)
    }
}

pub fn obfuscate(clear: &str) -> Vec<u8> {
    clear
        .bytes()
        .enumerate()
        .map(|(i, c)| obfuscate_byte(c, i))
        .collect()
}

pub fn deobfuscate(stored: &[u8]) -> String {
    stored
        .iter()
        .take_while(|&&c| c != 0)
        .enumerate()
        .map(|(i, &c)| deobfuscate_byte(c, i) as char)
        .collect()
}

pub struct PasswordStore {
    map: GrowableMap<PasswordRecord>,
}

impl PasswordStore {
    pub fn open(work_dir: &WorkDir) -> Result<Self> {
        Self::open_path(&work_dir.password_file())
    }

    pub fn open_path(path: &Path) -> Result<Self> {
        Ok(Self {
            map: GrowableMap::attach(path, PWB_STEP_SIZE)?,
        })
    }

    /// Look up the password for `user@host`. Absent stores and unknown
    /// names both come back as `None`; only real IO problems error.
    pub fn lookup(work_dir: &WorkDir, uh_name: &str) -> Result<Option<String>> {
        let path = work_dir.password_file();
        if !path.exists() {
            // No recipient ever carried a password, the store was
            // simply never created.
            return Ok(None);
        }
        let store = Self::open_path(&path)?;
        let _guard = lock_region_r(store.map.raw_fd(), 0, 1)?;
        Ok(store.get(uh_name))
    }

    pub fn len(&self) -> usize {
        self.map.count().max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, uh_name: &str) -> Option<String> {
        self.map
            .as_slice()
            .iter()
            .find(|r| record_name(r) == uh_name)
            .map(|r| deobfuscate(&r.passwd))
    }

    /// Insert or replace the password for `user@host`.
    pub fn set(&mut self, uh_name: &str, password: &str) -> Result<()> {
        let mut record: PasswordRecord = unsafe { std::mem::zeroed() };
        let n = uh_name.len().min(MAX_UH_NAME_LENGTH - 1);
        record.uh_name[..n].copy_from_slice(&uh_name.as_bytes()[..n]);
        let stored = obfuscate(password);
        let n = stored.len().min(MAX_PASSWORD_LENGTH - 1);
        record.passwd[..n].copy_from_slice(&stored[..n]);

        if let Some(existing) = self
            .map
            .as_mut_slice()
            .iter_mut()
            .find(|r| record_name(r) == uh_name)
        {
            *existing = record;
            return Ok(());
        }
        self.map.push(record)?;
        Ok(())
    }
}

fn record_name(record: &PasswordRecord) -> &str {
    let end = record
        .uh_name
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(record.uh_name.len());
    std::str::from_utf8(&record.uh_name[..end]).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obfuscation_round_trips() {
        for pw in ["", "a", "hunter2", "s3cr3t!with#symbols", "x".repeat(63).as_str()] {
            assert_eq!(deobfuscate(&obfuscate(pw)), pw);
        }
    }

    #[test]
    fn stored_bytes_differ_from_clear() {
        let stored = obfuscate("topsecret");
        assert_ne!(&stored[..], b"topsecret");
    }

    #[test]
    fn store_set_get() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PasswordStore::open_path(&dir.path().join("pwb.data")).unwrap();

        store.set("u@srv", "hunter2").unwrap();
        store.set("ops@mailhub", "pelagic").unwrap();
        assert_eq!(store.get("u@srv").as_deref(), Some("hunter2"));
        assert_eq!(store.get("ops@mailhub").as_deref(), Some("pelagic"));
        assert_eq!(store.get("nobody@nowhere"), None);

        store.set("u@srv", "changed").unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("u@srv").as_deref(), Some("changed"));
    }

    #[test]
    fn lookup_without_store_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let wd = WorkDir::new(dir.path());
        assert!(PasswordStore::lookup(&wd, "u@srv").unwrap().is_none());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pwb.data");
        {
            let mut store = PasswordStore::open_path(&path).unwrap();
            store.set("u@srv", "hunter2").unwrap();
        }
        let store = PasswordStore::open_path(&path).unwrap();
        assert_eq!(store.get("u@srv").as_deref(), Some("hunter2"));
    }
}
