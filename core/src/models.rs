use std::fmt;

use crate::error::FetchError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionFileDescriptor {
    pub session_id: u32,
}

/// Which fixed-layout record a decode diagnostic refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, uniffi::Enum)]
pub enum RecordKind {
    Header,
    Session,
    Event,
    Measurement,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordKind::Header => "header",
            RecordKind::Session => "session record",
            RecordKind::Event => "event",
            RecordKind::Measurement => "measurement",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, uniffi::Record)]
pub struct TimeSeriesSessionHeader {
    pub session_id: u32,
    pub session_timestamp: u32,
    pub declared_size: u32,
    pub checksum: u32,
    pub event_count: u16,
    pub measurement_count: u16,
    pub schema_version: u16,
    pub reserved: u16,
}

#[derive(Clone, Debug, PartialEq, uniffi::Record)]
pub struct GrindSession {
    pub session_id: u32,
    pub session_timestamp: u32,
    pub target_time_ms: u32,
    pub total_time_ms: u32,
    pub total_motor_on_time_ms: u32,
    pub time_error_ms: i32,
    pub target_weight: f32,
    pub tolerance: f32,
    pub final_weight: f32,
    pub error_grams: f32,
    pub start_weight: f32,
    pub initial_motor_stop_offset: f32,
    pub latency_to_coast_ratio: f32,
    pub flow_rate_threshold: f32,
    pub profile_id: u8,
    pub grind_mode: u8,
    pub max_pulse_attempts: u8,
    pub pulse_count: u8,
    pub termination_reason: u8,
    pub result_status: String,
}

impl GrindSession {
    pub fn mode(&self) -> GrindMode {
        GrindMode::from_id(self.grind_mode)
    }

    pub fn termination(&self) -> TerminationReason {
        TerminationReason::from_id(self.termination_reason)
    }
}

#[derive(Clone, Debug, PartialEq, uniffi::Record)]
pub struct GrindEvent {
    pub session_id: u32,
    pub timestamp_ms: u32,
    pub duration_ms: u32,
    pub grind_latency_ms: u32,
    pub settling_duration_ms: u32,
    pub start_weight: f32,
    pub end_weight: f32,
    pub motor_stop_target_weight: f32,
    pub pulse_duration_ms: f32,
    pub pulse_flow_rate: f32,
    pub event_sequence_id: u16,
    pub loop_count: u16,
    pub phase_id: u8,
    pub pulse_attempt_number: u8,
    pub event_flags: u8,
}

pub const EVENT_FLAG_TIME_MODE: u8 = 1 << 0;
pub const EVENT_FLAG_MOTOR_ACTIVE: u8 = 1 << 1;
pub const EVENT_FLAG_PULSE_PHASE: u8 = 1 << 2;

impl GrindEvent {
    pub fn phase(&self) -> GrindPhase {
        GrindPhase::from_id(self.phase_id)
    }

    pub fn is_time_mode(&self) -> bool {
        self.event_flags & EVENT_FLAG_TIME_MODE != 0
    }

    pub fn is_motor_active(&self) -> bool {
        self.event_flags & EVENT_FLAG_MOTOR_ACTIVE != 0
    }

    pub fn is_pulse_phase(&self) -> bool {
        self.event_flags & EVENT_FLAG_PULSE_PHASE != 0
    }
}

#[derive(Clone, Debug, PartialEq, uniffi::Record)]
pub struct GrindMeasurement {
    pub session_id: u32,
    pub timestamp_ms: u32,
    pub weight_grams: f32,
    pub weight_delta: f32,
    pub flow_rate_g_per_s: f32,
    pub motor_stop_target_weight: f32,
    pub sequence_id: u16,
    pub motor_is_on: bool,
    pub phase_id: u8,
    /// Set when `sequence_id` did not match its slot.
    pub out_of_sequence: bool,
}

impl GrindMeasurement {
    pub fn phase(&self) -> GrindPhase {
        GrindPhase::from_id(self.phase_id)
    }
}

/// Grind controller phase ids as logged by the firmware.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GrindPhase {
    Idle,
    Initializing,
    Setup,
    Taring,
    TareConfirm,
    Predictive,
    PulseDecision,
    PulseExecute,
    PulseSettling,
    FinalSettling,
    TimeGrinding,
    TimeAdditionalPulse,
    Completed,
    Timeout,
    Unknown(u8),
}

impl GrindPhase {
    pub fn from_id(id: u8) -> Self {
        match id {
            0 => GrindPhase::Idle,
            1 => GrindPhase::Initializing,
            2 => GrindPhase::Setup,
            3 => GrindPhase::Taring,
            4 => GrindPhase::TareConfirm,
            5 => GrindPhase::Predictive,
            6 => GrindPhase::PulseDecision,
            7 => GrindPhase::PulseExecute,
            8 => GrindPhase::PulseSettling,
            9 => GrindPhase::FinalSettling,
            10 => GrindPhase::TimeGrinding,
            11 => GrindPhase::TimeAdditionalPulse,
            12 => GrindPhase::Completed,
            13 => GrindPhase::Timeout,
            other => GrindPhase::Unknown(other),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            GrindPhase::Idle => "IDLE",
            GrindPhase::Initializing => "INITIALIZING",
            GrindPhase::Setup => "SETUP",
            GrindPhase::Taring => "TARING",
            GrindPhase::TareConfirm => "TARE_CONFIRM",
            GrindPhase::Predictive => "PREDICTIVE",
            GrindPhase::PulseDecision => "PULSE_DECISION",
            GrindPhase::PulseExecute => "PULSE_EXECUTE",
            GrindPhase::PulseSettling => "PULSE_SETTLING",
            GrindPhase::FinalSettling => "FINAL_SETTLING",
            GrindPhase::TimeGrinding => "TIME_GRINDING",
            GrindPhase::TimeAdditionalPulse => "TIME_ADDITIONAL_PULSE",
            GrindPhase::Completed => "COMPLETED",
            GrindPhase::Timeout => "TIMEOUT",
            GrindPhase::Unknown(_) => "UNKNOWN",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TerminationReason {
    Completed,
    Timeout,
    Overshoot,
    MaxPulses,
    Unknown(u8),
}

impl TerminationReason {
    pub fn from_id(id: u8) -> Self {
        match id {
            0 => TerminationReason::Completed,
            1 => TerminationReason::Timeout,
            2 => TerminationReason::Overshoot,
            3 => TerminationReason::MaxPulses,
            other => TerminationReason::Unknown(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GrindMode {
    Weight,
    Time,
    Unknown(u8),
}

impl GrindMode {
    pub fn from_id(id: u8) -> Self {
        match id {
            0 => GrindMode::Weight,
            1 => GrindMode::Time,
            other => GrindMode::Unknown(other),
        }
    }
}

/// Non-fatal observation made while decoding a session file.
#[derive(Clone, Debug, PartialEq, Eq, uniffi::Enum)]
pub enum DecodeWarning {
    SchemaVersionMismatch {
        session_id: u32,
        found: u16,
        supported: u16,
    },
    DeclaredSizeMismatch {
        session_id: u32,
        declared: u32,
        computed: u32,
    },
    MeasurementSequenceGap {
        session_id: u32,
        index: u16,
        expected: u32,
        found: u16,
    },
}

impl fmt::Display for DecodeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeWarning::SchemaVersionMismatch {
                session_id,
                found,
                supported,
            } => write!(
                f,
                "session {session_id} uses schema {found}, expected {supported}"
            ),
            DecodeWarning::DeclaredSizeMismatch {
                session_id,
                declared,
                computed,
            } => write!(
                f,
                "session {session_id} declares {declared} bytes, records span {computed}"
            ),
            DecodeWarning::MeasurementSequenceGap {
                session_id,
                index,
                expected,
                found,
            } => write!(
                f,
                "session {session_id} measurement {index}: expected sequence {expected}, got {found}"
            ),
        }
    }
}

/// One fully decoded session log file.
#[derive(Clone, Debug, PartialEq, uniffi::Record)]
pub struct DecodedSessionFile {
    pub header: TimeSeriesSessionHeader,
    pub session: GrindSession,
    pub events: Vec<GrindEvent>,
    pub measurements: Vec<GrindMeasurement>,
    pub warnings: Vec<DecodeWarning>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FailedSession {
    pub session_id: u32,
    pub reason: FetchError,
    /// Bytes received before the failure, kept for offline diagnosis.
    pub raw: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExportResult {
    pub sessions: Vec<GrindSession>,
    pub events: Vec<GrindEvent>,
    pub measurements: Vec<GrindMeasurement>,
    pub failed_session_ids: Vec<u32>,
    pub failures: Vec<FailedSession>,
    pub warnings: Vec<DecodeWarning>,
}

impl ExportResult {
    pub fn absorb(&mut self, decoded: DecodedSessionFile) {
        self.sessions.push(decoded.session);
        self.events.extend(decoded.events);
        self.measurements.extend(decoded.measurements);
        self.warnings.extend(decoded.warnings);
    }

    pub fn record_failure(&mut self, failure: FailedSession) {
        self.failed_session_ids.push(failure.session_id);
        self.failures.push(failure);
    }

    pub fn succeeded_session_ids(&self) -> Vec<u32> {
        self.sessions.iter().map(|s| s.session_id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.failed_session_ids.is_empty()
    }
}

// ============================================================================
// Firmware update payloads
// ============================================================================

/// A firmware image as built, with the build number read from its
/// companion metadata when available.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirmwareImage {
    pub bytes: Vec<u8>,
    pub build: Option<String>,
}

impl FirmwareImage {
    pub fn new(bytes: Vec<u8>, build: Option<String>) -> Self {
        Self { bytes, build }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FullUpdateReason {
    Forced,
    NoDeviceBuild,
    NoCachedFirmware,
    DeltaNotBeneficial,
}

impl fmt::Display for FullUpdateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FullUpdateReason::Forced => "forced full update",
            FullUpdateReason::NoDeviceBuild => "no device build info",
            FullUpdateReason::NoCachedFirmware => "no cached firmware",
            FullUpdateReason::DeltaNotBeneficial => "delta not beneficial",
        })
    }
}

/// The bytes actually sent over the OTA data characteristic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdatePayload {
    pub bytes: Vec<u8>,
    pub is_full: bool,
    pub size: u32,
    pub expected_build: Option<String>,
    pub full_reason: Option<FullUpdateReason>,
}
