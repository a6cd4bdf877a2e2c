//! Memory-mapped shared state for petrel processes.
//!
//! Every long-lived petrel process (the dispatcher, the senders, the
//! retrievers) coordinates through a small set of files mapped into all
//! of them: the file-transfer status area (FSA) with one record per
//! host, the error queue, the per-job duplicate-checksum stores and the
//! per-directory retrieve lists. Writers take byte-range advisory locks
//! over exactly the fields they mutate; readers take shared locks over
//! the records they iterate.

pub mod dupcheck;
pub mod error_queue;
pub mod fifo;
pub mod fsa;
pub mod growable;
pub mod region;
pub mod retrieve_list;

pub use dupcheck::{DupFlag, DupStore};
pub use error_queue::ErrorQueue;
pub use fsa::{FsaHandle, HostRecord, JobStatus};
pub use growable::GrowableMap;
pub use retrieve_list::{RetrieveEntry, RetrieveList};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("status area error: {0}")]
    Status(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StatusError>;

/// Bytes reserved in front of every mapped array: a count word plus a
/// sweep-deadline word. Offsets into mapped files never change once
/// written, so this is part of the on-disk format.
pub const WORD_OFFSET: usize = 16;
