//! The job-message model and the text formats around it.
//!
//! A job message is a small text file binding a set of spooled files to
//! one destination: a `[destination]` section with a recipient URL and
//! an optional `[options]` section of identifier lines. This crate
//! parses and writes those files, the HOST_CONFIG host table and the
//! obfuscated password store.

pub mod host_config;
pub mod message;
pub mod options;
pub mod password;
pub mod recipient;

pub use host_config::{HostConfig, HostConfigEntry};
pub use message::Message;
pub use options::{FtpMode, LockMode, Options, RestartFile, Subject};
pub use recipient::{Recipient, Scheme};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MsgError {
    /// The message is unusable: no destination, or the recipient line
    /// does not parse. The job carrying it must fail.
    #[error("invalid message: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Status(#[from] petrel_status::StatusError),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, MsgError>;
