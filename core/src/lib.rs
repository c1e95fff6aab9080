pub mod ble;
pub mod ble_mock;
pub mod codec;
pub mod config;
pub mod delta;
pub mod error;
pub mod export;
pub mod ffi;
pub mod firmware;
pub mod logging;
pub mod models;
pub mod ota;
pub mod protocol;
pub mod storage;

uniffi::setup_scaffolding!();

pub use ble::{Characteristic, GattLink, NotifyHandler};
pub use codec::decode_session_file;
pub use config::{DeltaConfig, ExportConfig, OtaConfig, TransferConfig};
pub use delta::{DeltaPatchSelector, FirmwareCache, PatchTool};
pub use error::{
    ConfigError, DecodeError, ExportError, FetchError, LinkError, OtaError, PatchError,
    SelectError, SinkError,
};
pub use export::{DataExport, ExportState, FileFetch};
pub use firmware::{load_firmware, DirectoryFirmwareCache};
pub use models::{
    DecodeWarning, DecodedSessionFile, ExportResult, FailedSession, FirmwareImage,
    FullUpdateReason, GrindEvent, GrindMeasurement, GrindMode, GrindPhase, GrindSession,
    SessionFileDescriptor, TerminationReason, TimeSeriesSessionHeader, UpdatePayload,
};
pub use ota::{read_device_build, OtaOutcome, OtaProgress, OtaTransfer};
pub use protocol::{ExportStatus, OtaSessionState};
pub use storage::{ExportSink, MemorySink};
