//! The petrel dispatcher.
//!
//! One long-running process that owns the status area: it reads the
//! host table, publishes the mapping, scans for queued jobs, spawns a
//! sender per connection and answers burst requests so an
//! authenticated connection can serve several jobs in a row.

pub mod config;
pub mod dispatcher;
pub mod queue;

pub use config::FdConfig;
pub use dispatcher::Dispatcher;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FdError {
    #[error("dispatcher error: {0}")]
    Dispatch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Status(#[from] petrel_status::StatusError),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FdError>;
