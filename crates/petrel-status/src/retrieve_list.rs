//! The retrieve list: what we know about one remote source directory.
//!
//! The inbound poller diffs every fresh directory listing against this
//! list to decide what still has to be fetched. For ordinary
//! directories the list is a mapped file under
//! `files/incoming/.list/<dir_alias>` so progress survives restarts;
//! when the directory is polled in stupid mode or with remove set, the
//! list only lives for one pass and is held in plain memory.

use std::path::Path;

use petrel_core::{WorkDir, MAX_FILENAME_LENGTH, MAX_FTP_DATE_LENGTH};

use crate::growable::{GrowableMap, MappedRecord};
use crate::Result;

pub const REMOTE_LIST_STEP_SIZE: usize = 10;

#[derive(Clone, Copy)]
#[repr(C)]
pub struct RetrieveEntry {
    pub file_name: [u8; MAX_FILENAME_LENGTH],
    /// Opaque server MDTM string; compared bytewise, never parsed.
    pub date: [u8; MAX_FTP_DATE_LENGTH],
    /// Remote size, -1 while unknown.
    pub size: i64,
    pub retrieved: u8,
    pub in_list: u8,
}

unsafe impl MappedRecord for RetrieveEntry {}

impl RetrieveEntry {
    pub fn new(name: &str) -> Self {
        let mut entry: Self = unsafe { std::mem::zeroed() };
        let n = name.len().min(MAX_FILENAME_LENGTH - 1);
        entry.file_name[..n].copy_from_slice(&name.as_bytes()[..n]);
        entry.size = -1;
        entry.in_list = 1;
        entry
    }

    pub fn file_name(&self) -> &str {
        let end = self
            .file_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.file_name.len());
        std::str::from_utf8(&self.file_name[..end]).unwrap_or("")
    }

    pub fn date(&self) -> &[u8] {
        &self.date
    }

    pub fn set_date(&mut self, date: &str) {
        self.date.fill(0);
        let n = date.len().min(MAX_FTP_DATE_LENGTH);
        self.date[..n].copy_from_slice(&date.as_bytes()[..n]);
    }

    pub fn date_matches(&self, date: &str) -> bool {
        let mut fresh = [0u8; MAX_FTP_DATE_LENGTH];
        let n = date.len().min(MAX_FTP_DATE_LENGTH);
        fresh[..n].copy_from_slice(&date.as_bytes()[..n]);
        fresh == self.date
    }
}

enum Backing {
    Mapped(GrowableMap<RetrieveEntry>),
    Transient(Vec<RetrieveEntry>),
}

pub struct RetrieveList {
    backing: Backing,
}

impl RetrieveList {
    /// Open the persistent list for `dir_alias`.
    pub fn open(work_dir: &WorkDir, dir_alias: &str) -> Result<Self> {
        Self::open_path(&work_dir.ls_data_file(dir_alias))
    }

    pub fn open_path(path: &Path) -> Result<Self> {
        Ok(Self {
            backing: Backing::Mapped(GrowableMap::attach(path, REMOTE_LIST_STEP_SIZE)?),
        })
    }

    /// A list that lives only for this polling pass (stupid mode or
    /// remove set).
    pub fn transient() -> Self {
        Self {
            backing: Backing::Transient(Vec::new()),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.backing, Backing::Transient(_))
    }

    pub fn len(&self) -> usize {
        match &self.backing {
            Backing::Mapped(m) => m.count().max(0) as usize,
            Backing::Transient(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> &[RetrieveEntry] {
        match &self.backing {
            Backing::Mapped(m) => m.as_slice(),
            Backing::Transient(v) => v.as_slice(),
        }
    }

    pub fn entries_mut(&mut self) -> &mut [RetrieveEntry] {
        match &mut self.backing {
            Backing::Mapped(m) => m.as_mut_slice(),
            Backing::Transient(v) => v.as_mut_slice(),
        }
    }

    /// Start a listing pass: everything is presumed gone until the
    /// fresh listing proves otherwise.
    pub fn begin_pass(&mut self) {
        for entry in self.entries_mut() {
            entry.in_list = 0;
        }
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.entries().iter().position(|e| e.file_name() == name)
    }

    pub fn push(&mut self, entry: RetrieveEntry) -> Result<()> {
        match &mut self.backing {
            Backing::Mapped(m) => m.push(entry),
            Backing::Transient(v) => {
                v.push(entry);
                Ok(())
            }
        }
    }

    /// Drop every entry the last listing no longer contained and give
    /// the file back to the allocator step granularity. Returns how
    /// many entries were removed.
    pub fn compact(&mut self) -> Result<usize> {
        let removed;
        match &mut self.backing {
            Backing::Mapped(m) => {
                let before = m.count().max(0) as usize;
                let mut kept = 0usize;
                for i in 0..before {
                    if m.as_slice()[i].in_list != 0 {
                        if kept != i {
                            let entry = m.as_slice()[i];
                            m.as_mut_slice()[kept] = entry;
                        }
                        kept += 1;
                    }
                }
                m.set_count(kept as i32);
                removed = before - kept;
                if removed > 0 {
                    m.shrink_to_fit()?;
                }
            }
            Backing::Transient(v) => {
                let before = v.len();
                v.retain(|e| e.in_list != 0);
                removed = before - v.len();
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_pass_keeps_listed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut rl = RetrieveList::open_path(&dir.path().join("wx-in")).unwrap();

        let mut x = RetrieveEntry::new("X");
        x.retrieved = 1;
        x.set_date("20260801");
        x.size = 100;
        rl.push(x).unwrap();
        rl.push(RetrieveEntry::new("Y")).unwrap();

        rl.begin_pass();
        // Fresh listing contains only X.
        let pos = rl.position("X").unwrap();
        rl.entries_mut()[pos].in_list = 1;

        assert_eq!(rl.compact().unwrap(), 1);
        assert_eq!(rl.len(), 1);
        assert_eq!(rl.entries()[0].file_name(), "X");
        assert_eq!(rl.entries()[0].retrieved, 1);
    }

    #[test]
    fn persistent_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wx-in");
        {
            let mut rl = RetrieveList::open_path(&path).unwrap();
            let mut e = RetrieveEntry::new("A");
            e.set_date("20260801093000");
            e.size = 42;
            e.retrieved = 1;
            rl.push(e).unwrap();
        }
        let rl = RetrieveList::open_path(&path).unwrap();
        assert_eq!(rl.len(), 1);
        let e = &rl.entries()[0];
        assert_eq!(e.file_name(), "A");
        assert!(e.date_matches("20260801093000"));
        assert_eq!(e.size, 42);
        assert_eq!(e.retrieved, 1);
    }

    #[test]
    fn transient_list_compacts_in_memory() {
        let mut rl = RetrieveList::transient();
        rl.push(RetrieveEntry::new("A")).unwrap();
        rl.push(RetrieveEntry::new("B")).unwrap();
        rl.begin_pass();
        assert_eq!(rl.compact().unwrap(), 2);
        assert!(rl.is_empty());
    }

    #[test]
    fn date_change_detection() {
        let mut e = RetrieveEntry::new("A");
        e.set_date("20260801090000");
        assert!(e.date_matches("20260801090000"));
        assert!(!e.date_matches("20260801100000"));
    }
}
