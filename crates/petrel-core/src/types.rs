use serde::{Deserialize, Serialize};

/// What a job-status slot is currently doing.
///
/// Stored as a single byte in the shared status area so other processes
/// can read it without interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectStatus {
    NotWorking = 0,
    Disconnect = 1,
    FtpActive = 2,
    FtpBurstActive = 3,
    RetrieveActive = 4,
    Closing = 5,
}

impl ConnectStatus {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectStatus::Disconnect,
            2 => ConnectStatus::FtpActive,
            3 => ConnectStatus::FtpBurstActive,
            4 => ConnectStatus::RetrieveActive,
            5 => ConnectStatus::Closing,
            _ => ConnectStatus::NotWorking,
        }
    }
}

/// Bits of the per-host `host_status` field.
pub mod host_status {
    pub const PAUSE_QUEUE: u32 = 1 << 0;
    pub const AUTO_PAUSE_QUEUE: u32 = 1 << 1;
    pub const STOP_TRANSFER: u32 = 1 << 2;
    pub const HOST_DISABLED: u32 = 1 << 3;
    /// Set while at least one error-queue entry exists for this host.
    pub const ERROR_QUEUE_SET: u32 = 1 << 4;
}

/// Bits of the per-host `special_flag` field.
pub mod special_flag {
    /// Send SITE IDLE after login.
    pub const SET_IDLE_TIME: u32 = 1 << 0;
    /// Probe the control connection with STAT during long transfers.
    pub const STAT_KEEPALIVE: u32 = 1 << 1;
    /// Use passive mode data connections for this host.
    pub const FTP_PASSIVE_MODE: u32 = 1 << 2;
}

/// Bits of the per-job `special_flag` carried in the message options.
pub mod job_flag {
    pub const ADD_EUMETSAT_HEADER: u32 = 1 << 0;
    pub const FILE_NAME_IS_HEADER: u32 = 1 << 1;
    pub const EXEC_FTP: u32 = 1 << 2;
    pub const TRANS_EXEC: u32 = 1 << 3;
    pub const FILE_NAME_IS_SUBJECT: u32 = 1 << 4;
    pub const FILE_NAME_IS_USER: u32 = 1 << 5;
    pub const FORCE_COPY: u32 = 1 << 6;
    pub const ENCODE_ANSI: u32 = 1 << 7;
    pub const CHECK_REPLY: u32 = 1 << 8;
    pub const WITH_SEQUENCE_NUMBER: u32 = 1 << 9;
    pub const ATTACH_FILE: u32 = 1 << 10;
    pub const ATTACH_ALL_FILES: u32 = 1 << 11;
    pub const CHANGE_UID_GID: u32 = 1 << 12;
}

/// How the remote size of a partly transmitted file is discovered for
/// append-resume.
///
/// `Disabled` turns resume off for the host. `Auto` asks with SIZE.
/// `ListToken(n)` sends LIST and reads the n'th whitespace token of the
/// reply line as a decimal size, for servers without SIZE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileSizeOffset {
    Disabled,
    Auto,
    ListToken(u8),
}

/// Raw value used for `Auto` in HOST_CONFIG.
pub const AUTO_SIZE_DETECT: i8 = -2;

impl FileSizeOffset {
    pub fn from_raw(raw: i8) -> Self {
        match raw {
            -1 => FileSizeOffset::Disabled,
            AUTO_SIZE_DETECT => FileSizeOffset::Auto,
            n if n >= 0 => FileSizeOffset::ListToken(n as u8),
            _ => FileSizeOffset::Disabled,
        }
    }

    pub fn to_raw(self) -> i8 {
        match self {
            FileSizeOffset::Disabled => -1,
            FileSizeOffset::Auto => AUTO_SIZE_DETECT,
            FileSizeOffset::ListToken(n) => n as i8,
        }
    }

    pub fn enabled(self) -> bool {
        self != FileSizeOffset::Disabled
    }
}

/// Block-mode framing descriptors (3-byte header `{descriptor, len_be}`).
pub mod block_mode {
    pub const DATA_BLOCK: u8 = 128;
    pub const END_BLOCK: u8 = 64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_size_offset_raw_round_trip() {
        assert_eq!(FileSizeOffset::from_raw(-1), FileSizeOffset::Disabled);
        assert_eq!(FileSizeOffset::from_raw(-2), FileSizeOffset::Auto);
        assert_eq!(FileSizeOffset::from_raw(4), FileSizeOffset::ListToken(4));
        for fso in [
            FileSizeOffset::Disabled,
            FileSizeOffset::Auto,
            FileSizeOffset::ListToken(2),
        ] {
            assert_eq!(FileSizeOffset::from_raw(fso.to_raw()), fso);
        }
    }

    #[test]
    fn connect_status_from_byte() {
        assert_eq!(ConnectStatus::from_u8(0), ConnectStatus::NotWorking);
        assert_eq!(ConnectStatus::from_u8(3), ConnectStatus::FtpBurstActive);
        assert_eq!(ConnectStatus::from_u8(99), ConnectStatus::NotWorking);
    }
}
