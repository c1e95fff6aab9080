use std::path::PathBuf;

use thiserror::Error;

use crate::ble::Characteristic;
use crate::models::RecordKind;
use crate::protocol::OtaSessionState;

/// Transport-level failure reported by the GATT link.
///
/// The protocol core never retries these; they are surfaced as-is.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("link is not connected")]
    NotConnected,

    #[error("link disconnected")]
    Disconnected,

    #[error("write to {characteristic} failed: {message}")]
    WriteFailed {
        characteristic: Characteristic,
        message: String,
    },

    #[error("read from {characteristic} failed: {message}")]
    ReadFailed {
        characteristic: Characteristic,
        message: String,
    },

    #[error("subscribe to {characteristic} failed: {message}")]
    SubscribeFailed {
        characteristic: Characteristic,
        message: String,
    },
}

impl LinkError {
    /// True for the failures a rebooting device produces.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, LinkError::NotConnected | LinkError::Disconnected)
    }
}

/// Error type for decoding one session log file.
///
/// Always fatal to that one file, never to the export as a whole.
#[derive(Error, Debug, Clone, PartialEq, Eq, uniffi::Error)]
pub enum DecodeError {
    #[error("frame too short: {len} bytes, need at least {required}")]
    FrameTooShort { len: u64, required: u64 },

    #[error("session id mismatch in {record}: expected {expected}, got {found}")]
    SessionIdMismatch {
        record: RecordKind,
        expected: u32,
        found: u32,
    },

    #[error("event {index} truncated at offset {offset} (file is {len} bytes)")]
    TruncatedEvent { index: u16, offset: u64, len: u64 },

    #[error("measurement {index} truncated at offset {offset} (file is {len} bytes)")]
    TruncatedMeasurement { index: u16, offset: u64, len: u64 },

    #[error("event sequence out of order at slot {index}: expected {expected}, got {found}")]
    EventSequenceOutOfOrder { index: u16, expected: u32, found: u16 },

    #[error("{record} count overflow: emitted {emitted}, header declares {declared}")]
    CountOverflow {
        record: RecordKind,
        emitted: u64,
        declared: u16,
    },
}

/// Failure of the external diff tool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("diff tool unavailable: {0}")]
    ToolUnavailable(String),

    #[error("diff tool failed: {0}")]
    ToolFailed(String),
}

/// Failure to build an update payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectError {
    #[error("patch generation failed: {0}")]
    PatchGenerationFailed(#[from] PatchError),

    #[error("firmware image is empty")]
    EmptyFirmware,

    #[error("payload of {size} bytes does not fit the start frame")]
    PayloadTooLarge { size: u64 },
}

/// Terminal failure of an OTA attempt.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OtaError {
    #[error("update payload is empty")]
    EmptyPayload,

    #[error("ota session already used (state {state})")]
    SessionAlreadyUsed { state: OtaSessionState },

    #[error("device did not start receiving within {waited_ms} ms")]
    StartTimeout { waited_ms: u64 },

    #[error("device rejected the start frame")]
    DeviceRejected,

    #[error("device reported an error after {offset} bytes")]
    DeviceError { offset: u64 },

    #[error("transfer aborted after {offset} bytes: {cause}")]
    TransferAborted {
        offset: u64,
        #[source]
        cause: LinkError,
    },

    #[error("device failed to apply the update")]
    ApplyFailed,

    #[error("ota cancelled")]
    Cancelled,

    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Failure of the export as a whole.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExportError {
    #[error("no file list received within {waited_ms} ms")]
    FileListTimeout { waited_ms: u64 },

    #[error("malformed file list ({len} bytes)")]
    MalformedFileList { len: u64 },

    #[error("device reported an export error")]
    DeviceError,

    #[error("no session count received within {waited_ms} ms")]
    SessionCountTimeout { waited_ms: u64 },

    #[error("export cancelled")]
    Cancelled,

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Why a single session file could not be fetched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("session {session_id}: no completion within {waited_ms} ms")]
    FetchTimeout { session_id: u32, waited_ms: u64 },

    #[error("session {session_id}: device reported an export error")]
    DeviceError { session_id: u32 },

    #[error("session {session_id}: {cause}")]
    Decode {
        session_id: u32,
        #[source]
        cause: DecodeError,
    },

    #[error("session {session_id}: {cause}")]
    Link {
        session_id: u32,
        #[source]
        cause: LinkError,
    },
}

impl FetchError {
    pub fn session_id(&self) -> u32 {
        match self {
            FetchError::FetchTimeout { session_id, .. }
            | FetchError::DeviceError { session_id }
            | FetchError::Decode { session_id, .. }
            | FetchError::Link { session_id, .. } => *session_id,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {cause}")]
    Io {
        path: PathBuf,
        #[source]
        cause: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failure reported by the persistence collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("export sink rejected result: {0}")]
pub struct SinkError(pub String);
