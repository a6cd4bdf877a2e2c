//! Archiving sent files instead of deleting them.
//!
//! A job with an archive retention moves every sent file into
//! `archive/<msg_name>_<expiry>` where `<expiry>` is the unix time the
//! directory may be reaped. The directory is created once per job and
//! remembered, so every file after the first is a bare rename.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use petrel_core::WorkDir;

const ARCHIVE_UNIT: u64 = 86_400;

pub struct Archiver {
    base: PathBuf,
    /// The per-job archive directory once it exists, or a latched
    /// failure so we do not retry a broken filesystem for every file.
    job_dir: Option<Result<PathBuf, ()>>,
}

impl Archiver {
    pub fn new(work_dir: &WorkDir) -> Self {
        Self {
            base: work_dir.archive_dir(),
            job_dir: None,
        }
    }

    /// Move `src` into the job's archive directory. Returns the
    /// archived path, or `Err` when archiving is impossible; the
    /// caller must then unlink the file so the spool cannot fill up.
    pub fn archive(
        &mut self,
        src: &Path,
        final_name: &str,
        msg_name: &str,
        archive_days: u32,
    ) -> Result<PathBuf, ()> {
        let dir = self.job_dir(msg_name, archive_days)?;
        let dst = dir.join(final_name);
        match std::fs::rename(src, &dst) {
            Ok(()) => Ok(dst),
            Err(e) => {
                tracing::error!(
                    src = %src.display(),
                    dst = %dst.display(),
                    "failed to archive: {}", e
                );
                Err(())
            }
        }
    }

    fn job_dir(&mut self, msg_name: &str, archive_days: u32) -> Result<PathBuf, ()> {
        if let Some(cached) = &self.job_dir {
            return cached.clone();
        }
        let expiry = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            + u64::from(archive_days) * ARCHIVE_UNIT;
        let dir = self.base.join(format!("{msg_name}_{expiry}"));
        let result = match std::fs::create_dir_all(&dir) {
            Ok(()) => Ok(dir),
            Err(e) => {
                tracing::error!(dir = %self.base.display(), "cannot create archive directory: {}", e);
                Err(())
            }
        };
        self.job_dir = Some(result.clone());
        result
    }

    /// A new job re-resolves its own directory.
    pub fn reset(&mut self) {
        self.job_dir = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn archives_under_cached_dir() {
        let dir = tempfile::tempdir().unwrap();
        let wd = WorkDir::new(dir.path());
        wd.create_all().unwrap();

        let spool = dir.path().join("spool");
        std::fs::create_dir(&spool).unwrap();
        for name in ["a", "b"] {
            let mut f = std::fs::File::create(spool.join(name)).unwrap();
            f.write_all(b"x").unwrap();
        }

        let mut archiver = Archiver::new(&wd);
        let a = archiver.archive(&spool.join("a"), "a", "3_0_17", 2).unwrap();
        let b = archiver.archive(&spool.join("b"), "b", "3_0_17", 2).unwrap();

        assert!(a.exists());
        assert!(b.exists());
        assert_eq!(a.parent(), b.parent());
        assert!(!spool.join("a").exists());
        let dirname = a.parent().unwrap().file_name().unwrap().to_string_lossy().to_string();
        assert!(dirname.starts_with("3_0_17_"));
    }

    #[test]
    fn failure_is_latched() {
        let dir = tempfile::tempdir().unwrap();
        let wd = WorkDir::new(dir.path());
        // No create_all: the archive base is missing and, because a
        // file sits at its path, cannot be created.
        std::fs::create_dir_all(dir.path().join("files")).unwrap();
        std::fs::write(wd.archive_dir(), b"").unwrap();

        let mut archiver = Archiver::new(&wd);
        assert!(archiver.archive(Path::new("/nonexistent"), "a", "m", 1).is_err());
        assert!(archiver.archive(Path::new("/nonexistent"), "b", "m", 1).is_err());
    }
}
