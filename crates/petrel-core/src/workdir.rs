use std::path::{Path, PathBuf};

/// Environment variable consulted when no --work-dir is given.
pub const WORK_DIR_ENV: &str = "PETREL_WORK_DIR";

/// The on-disk layout every petrel process agrees on.
///
/// All shared state (fifos, mapped status files, message files, spool
/// directories) lives under one work directory. Only this type builds
/// paths below it, so the layout is defined in exactly one place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve from an explicit argument or `$PETREL_WORK_DIR`.
    pub fn resolve(arg: Option<PathBuf>) -> crate::error::Result<Self> {
        match arg.or_else(|| std::env::var_os(WORK_DIR_ENV).map(PathBuf::from)) {
            Some(root) => Ok(Self::new(root)),
            None => Err(crate::error::CoreError::Config(format!(
                "no work directory given and {WORK_DIR_ENV} is not set"
            ))),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rendezvous directory for fifos, id files and other mapped state.
    pub fn fifo_dir(&self) -> PathBuf {
        self.root.join("fifo")
    }

    pub fn fifo(&self, name: &str) -> PathBuf {
        self.fifo_dir().join(name)
    }

    pub fn fsa_id_file(&self) -> PathBuf {
        self.fifo_dir().join("fsa.id")
    }

    pub fn fsa_stat_file(&self, id: i32) -> PathBuf {
        self.fifo_dir().join(format!("fsa.{id}"))
    }

    pub fn password_file(&self) -> PathBuf {
        self.fifo_dir().join("pwb.data")
    }

    pub fn error_queue_file(&self) -> PathBuf {
        self.fifo_dir().join("error.queue")
    }

    /// Job message files, one per job id.
    pub fn msg_dir(&self) -> PathBuf {
        self.root.join("msgs")
    }

    pub fn msg_file(&self, job_id: u32) -> PathBuf {
        self.msg_dir().join(format!("{job_id}"))
    }

    /// Spool directory holding the files of one queued job.
    pub fn job_file_dir(&self, msg_name: &str) -> PathBuf {
        self.root.join("files").join(msg_name)
    }

    pub fn incoming_dir(&self) -> PathBuf {
        self.root.join("files").join("incoming")
    }

    /// Duplicate-checksum stores, one mapped file per job id (hex).
    pub fn crc_dir(&self) -> PathBuf {
        self.incoming_dir().join(".crc")
    }

    pub fn crc_file(&self, job_id: u32) -> PathBuf {
        self.crc_dir().join(format!("{job_id:x}"))
    }

    /// Retrieve lists, one mapped file per source directory alias.
    pub fn ls_data_dir(&self) -> PathBuf {
        self.incoming_dir().join(".list")
    }

    pub fn ls_data_file(&self, dir_alias: &str) -> PathBuf {
        self.ls_data_dir().join(dir_alias)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    /// Create every directory of the layout. Idempotent.
    pub fn create_all(&self) -> std::io::Result<()> {
        for dir in [
            self.fifo_dir(),
            self.msg_dir(),
            self.incoming_dir(),
            self.crc_dir(),
            self.ls_data_dir(),
            self.archive_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
