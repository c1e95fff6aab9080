//! Wire vocabulary shared with the grinder firmware.
//!
//! Every byte value here must match the device exactly.

use std::fmt;

// ============================================================================
// Control commands
// ============================================================================

pub const OTA_CMD_START: u8 = 0x01;
pub const OTA_CMD_END: u8 = 0x03;
pub const OTA_CMD_ABORT: u8 = 0x04;

pub const DATA_CMD_STOP_EXPORT: u8 = 0x11;
pub const DATA_CMD_GET_COUNT: u8 = 0x12;
pub const DATA_CMD_CLEAR_DATA: u8 = 0x13;
pub const DATA_CMD_GET_FILE_LIST: u8 = 0x14;
pub const DATA_CMD_REQUEST_FILE: u8 = 0x15;

/// Value of the build-number characteristic on a device without one.
pub const NO_BUILD_NUMBER: &str = "no_build_number";

// ============================================================================
// Status bytes
// ============================================================================

/// OTA status as reported by the device on the OTA status characteristic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OtaSessionState {
    Idle,
    Ready,
    Receiving,
    Success,
    Error,
    Unknown(u8),
}

impl OtaSessionState {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => OtaSessionState::Idle,
            0x01 => OtaSessionState::Ready,
            0x02 => OtaSessionState::Receiving,
            0x03 => OtaSessionState::Success,
            0x04 => OtaSessionState::Error,
            other => OtaSessionState::Unknown(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            OtaSessionState::Idle => 0x00,
            OtaSessionState::Ready => 0x01,
            OtaSessionState::Receiving => 0x02,
            OtaSessionState::Success => 0x03,
            OtaSessionState::Error => 0x04,
            OtaSessionState::Unknown(b) => b,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OtaSessionState::Success | OtaSessionState::Error)
    }
}

impl fmt::Display for OtaSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OtaSessionState::Idle => f.write_str("idle"),
            OtaSessionState::Ready => f.write_str("ready"),
            OtaSessionState::Receiving => f.write_str("receiving"),
            OtaSessionState::Success => f.write_str("success"),
            OtaSessionState::Error => f.write_str("error"),
            OtaSessionState::Unknown(b) => write!(f, "unknown(0x{b:02X})"),
        }
    }
}

/// Export status as reported on the data status characteristic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExportStatus {
    Idle,
    Exporting,
    Complete,
    Error,
}

impl ExportStatus {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x20 => Some(ExportStatus::Idle),
            0x21 => Some(ExportStatus::Exporting),
            0x22 => Some(ExportStatus::Complete),
            0x23 => Some(ExportStatus::Error),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            ExportStatus::Idle => 0x20,
            ExportStatus::Exporting => 0x21,
            ExportStatus::Complete => 0x22,
            ExportStatus::Error => 0x23,
        }
    }
}

/// One notification from the data status characteristic.
///
/// The firmware multiplexes three payload shapes onto the same
/// characteristic: a bare status byte, an `[Exporting, percent]` progress
/// pair, and a two-byte little-endian stored-session count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataStatusNotification {
    Status(ExportStatus),
    Progress(u8),
    SessionCount(u16),
    Unrecognized,
}

impl DataStatusNotification {
    /// Status values only ever arrive as a single byte, so any two-byte
    /// payload other than a progress pair is a session count.
    pub fn parse(data: &[u8]) -> Self {
        let exporting = ExportStatus::Exporting.to_byte();
        match data {
            [byte] => ExportStatus::from_byte(*byte)
                .map_or(DataStatusNotification::Unrecognized, DataStatusNotification::Status),
            [first, percent] if *first == exporting => DataStatusNotification::Progress(*percent),
            [lo, hi] => DataStatusNotification::SessionCount(u16::from_le_bytes([*lo, *hi])),
            _ => DataStatusNotification::Unrecognized,
        }
    }
}
