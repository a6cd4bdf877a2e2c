use thiserror::Error;

/// Exit status of a sender or retriever process.
///
/// Every error class maps to one documented integer so the dispatcher
/// can tell from `waitpid` alone what went wrong. `TransferSuccess` is
/// zero; the rest are stable and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[repr(i32)]
pub enum ExitStatus {
    TransferSuccess = 0,
    ConnectError = 1,
    UserError = 2,
    PasswordError = 3,
    TypeError = 4,
    ListError = 5,
    ChdirError = 6,
    OpenRemoteError = 10,
    WriteRemoteError = 11,
    CloseRemoteError = 12,
    MoveRemoteError = 13,
    ReadRemoteError = 14,
    WriteLockError = 15,
    RemoveLockfileError = 16,
    TimeoutError = 20,
    OpenLocalError = 30,
    ReadLocalError = 31,
    WriteLocalError = 32,
    AllocError = 40,
    StillFilesToSend = 41,
    QuitError = 42,
    GotKilled = 50,
    Incorrect = 100,
}

impl ExitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitStatus::TransferSuccess => "Transfer successful",
            ExitStatus::ConnectError => "Failed to connect to remote host",
            ExitStatus::UserError => "Remote site rejected user name",
            ExitStatus::PasswordError => "Remote site rejected password",
            ExitStatus::TypeError => "Failed to set transfer type",
            ExitStatus::ListError => "Failed to list remote directory",
            ExitStatus::ChdirError => "Failed to change remote directory",
            ExitStatus::OpenRemoteError => "Failed to open remote file",
            ExitStatus::WriteRemoteError => "Failed to write to remote file",
            ExitStatus::CloseRemoteError => "Failed to close remote file",
            ExitStatus::MoveRemoteError => "Failed to rename remote file",
            ExitStatus::ReadRemoteError => "Failed to read from remote file",
            ExitStatus::WriteLockError => "Failed to create remote lock file",
            ExitStatus::RemoveLockfileError => "Failed to remove remote lock file",
            ExitStatus::TimeoutError => "Transfer timed out",
            ExitStatus::OpenLocalError => "Failed to open local file",
            ExitStatus::ReadLocalError => "Failed to read local file",
            ExitStatus::WriteLocalError => "Failed to write local file",
            ExitStatus::AllocError => "Failed to allocate memory",
            ExitStatus::StillFilesToSend => "Still files left to send",
            ExitStatus::QuitError => "Failed to quit cleanly",
            ExitStatus::GotKilled => "Process was killed",
            ExitStatus::Incorrect => "Internal error",
        }
    }

    pub fn code(&self) -> i32 {
        *self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        use ExitStatus::*;
        let status = match code {
            0 => TransferSuccess,
            1 => ConnectError,
            2 => UserError,
            3 => PasswordError,
            4 => TypeError,
            5 => ListError,
            6 => ChdirError,
            10 => OpenRemoteError,
            11 => WriteRemoteError,
            12 => CloseRemoteError,
            13 => MoveRemoteError,
            14 => ReadRemoteError,
            15 => WriteLockError,
            16 => RemoveLockfileError,
            20 => TimeoutError,
            30 => OpenLocalError,
            31 => ReadLocalError,
            32 => WriteLocalError,
            40 => AllocError,
            41 => StillFilesToSend,
            42 => QuitError,
            50 => GotKilled,
            100 => Incorrect,
            _ => return None,
        };
        Some(status)
    }
}

/// Errors shared by every petrel crate.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_round_trip() {
        for status in [
            ExitStatus::TransferSuccess,
            ExitStatus::ConnectError,
            ExitStatus::TimeoutError,
            ExitStatus::StillFilesToSend,
            ExitStatus::GotKilled,
        ] {
            assert_eq!(ExitStatus::from_code(status.code()), Some(status));
        }
    }

    #[test]
    fn unknown_code_is_none() {
        assert_eq!(ExitStatus::from_code(77), None);
    }
}
