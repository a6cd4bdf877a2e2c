pub mod error;
pub mod types;
pub mod workdir;

pub use error::ExitStatus;
pub use types::{ConnectStatus, FileSizeOffset};
pub use workdir::WorkDir;

/// Host alias as stored in HOST_CONFIG and the status area.
pub const MAX_HOST_ALIAS_LENGTH: usize = 8;
/// Real host name fields of a host record.
pub const MAX_REAL_HOSTNAME_LENGTH: usize = 40;
pub const MAX_PROXY_NAME_LENGTH: usize = 80;
pub const MAX_FILENAME_LENGTH: usize = 256;
/// The unique-name mailbox inside a job-status slot.
pub const MAX_MSG_NAME_LENGTH: usize = 30;
/// Longest single reply line accepted from a remote server.
pub const MAX_RET_MSG_LENGTH: usize = 1024;
pub const MAX_RULE_HEADER_LENGTH: usize = 50;
/// Opaque server MDTM string, e.g. "20260801104500".
pub const MAX_FTP_DATE_LENGTH: usize = 16;

pub const DEFAULT_FTP_PORT: u16 = 21;
pub const DEFAULT_TRANSFER_TIMEOUT: u64 = 120;
pub const DEFAULT_TRANSFER_BLOCK_SIZE: usize = 4096;
pub const DEFAULT_RETRY_INTERVAL: u64 = 120;
pub const DEFAULT_MAX_ERRORS: u32 = 10;
pub const DEFAULT_ARCHIVE_TIME: u32 = 0;
/// Upper bound on parallel connections to one host, and thus on the
/// number of job-status slots in a host record.
pub const MAX_NO_PARALLEL_JOBS: usize = 5;

/// How often a data connection refused with 425 is retried.
pub const MAX_DATA_CONNECT_RETRIES: u32 = 3;

/// Seconds between STAT keep-alive probes on the control connection.
pub const FTP_CTRL_KEEP_ALIVE_INTERVAL: u64 = 30;

/// FIFO names under the work directory's fifo/ subtree.
pub const SF_FIN_FIFO: &str = "sf.fin";
pub const FD_WAKE_UP_FIFO: &str = "fd.wakeup";
