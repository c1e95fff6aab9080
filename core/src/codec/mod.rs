//! Binary frame codec for the grinder's session log files and control frames.
//!
//! A session file as stored on the device is laid out as
//!
//! ```text
//! [TimeSeriesSessionHeader  24 bytes]
//! [GrindSession             80 bytes]
//! [GrindEvent       44 bytes x event_count]
//! [GrindMeasurement 24 bytes x measurement_count]
//! ```
//!
//! All integers are little-endian, floats are IEEE-754 single precision.
//! Decoding is a pure transform; retry and skip policy belongs to the caller.

pub mod control;
pub mod records;

pub use control::{
    encode_file_request, encode_start_frame, file_list_satisfied, parse_file_list, FileList,
};
pub use records::{EVENT_SIZE, HEADER_SIZE, MEASUREMENT_SIZE, SESSION_SIZE};

use log::{debug, warn};

use crate::error::DecodeError;
use crate::models::{
    DecodeWarning, DecodedSessionFile, GrindEvent, GrindMeasurement, RecordKind,
    TimeSeriesSessionHeader,
};
use records::Res;

/// Log schema this decoder was written against. Other versions are decoded
/// anyway with a warning.
pub const SUPPORTED_SCHEMA_VERSION: u16 = 2;

const EVENT_SENTINEL_TIMESTAMP: u32 = 0xFFFF_FFFF;
const EVENT_SENTINEL_PHASE: u8 = 0xFF;
const MEASUREMENT_SENTINEL_TIMESTAMP: u32 = 0xFFFF_FFFF;
const MEASUREMENT_SENTINEL_WEIGHT: f32 = -999.0;

/// Decode one session log file fetched for `expected_session_id`.
pub fn decode_session_file(
    bytes: &[u8],
    expected_session_id: u32,
) -> Result<DecodedSessionFile, DecodeError> {
    let required = HEADER_SIZE + SESSION_SIZE;
    let too_short = || DecodeError::FrameTooShort {
        len: bytes.len() as u64,
        required: required as u64,
    };
    if bytes.len() < required {
        return Err(too_short());
    }

    let mut warnings = Vec::new();

    let header = parse_fixed(&bytes[..HEADER_SIZE], records::header).ok_or_else(too_short)?;
    if header.session_id != expected_session_id {
        return Err(DecodeError::SessionIdMismatch {
            record: RecordKind::Header,
            expected: expected_session_id,
            found: header.session_id,
        });
    }
    if header.schema_version != SUPPORTED_SCHEMA_VERSION {
        let warning = DecodeWarning::SchemaVersionMismatch {
            session_id: expected_session_id,
            found: header.schema_version,
            supported: SUPPORTED_SCHEMA_VERSION,
        };
        warn!("{warning}, attempting to parse anyway");
        warnings.push(warning);
    }
    let computed = records_span(&header);
    if u64::from(header.declared_size) != computed {
        let warning = DecodeWarning::DeclaredSizeMismatch {
            session_id: expected_session_id,
            declared: header.declared_size,
            computed: u32::try_from(computed).unwrap_or(u32::MAX),
        };
        warn!("{warning}");
        warnings.push(warning);
    }

    let session = parse_fixed(&bytes[HEADER_SIZE..required], records::session_record)
        .ok_or_else(too_short)?;
    if session.session_id != expected_session_id {
        return Err(DecodeError::SessionIdMismatch {
            record: RecordKind::Session,
            expected: expected_session_id,
            found: session.session_id,
        });
    }

    let mut offset = required;
    let events = decode_events(bytes, &mut offset, &header)?;
    let measurements = decode_measurements(bytes, &mut offset, &header, &mut warnings)?;

    check_count(RecordKind::Event, events.len(), header.event_count)?;
    check_count(RecordKind::Measurement, measurements.len(), header.measurement_count)?;

    if offset < bytes.len() {
        debug!(
            "session {}: {} trailing bytes after last record",
            expected_session_id,
            bytes.len() - offset
        );
    }
    debug!(
        "session {} decoded: {} events, {} measurements",
        expected_session_id,
        events.len(),
        measurements.len()
    );

    Ok(DecodedSessionFile {
        header,
        session,
        events,
        measurements,
        warnings,
    })
}

fn parse_fixed<'a, T>(slot: &'a [u8], parser: impl FnOnce(&'a [u8]) -> Res<'a, T>) -> Option<T> {
    parser(slot).ok().map(|(_, value)| value)
}

fn records_span(header: &TimeSeriesSessionHeader) -> u64 {
    SESSION_SIZE as u64
        + EVENT_SIZE as u64 * u64::from(header.event_count)
        + MEASUREMENT_SIZE as u64 * u64::from(header.measurement_count)
}

fn is_event_sentinel(event: &GrindEvent) -> bool {
    event.timestamp_ms == EVENT_SENTINEL_TIMESTAMP || event.phase_id == EVENT_SENTINEL_PHASE
}

fn is_measurement_sentinel(measurement: &GrindMeasurement) -> bool {
    measurement.timestamp_ms == MEASUREMENT_SENTINEL_TIMESTAMP
        || measurement.weight_grams == MEASUREMENT_SENTINEL_WEIGHT
}

/// Events must carry their slot index as sequence id. Sentinel slots consume
/// a sequence number without producing a record.
fn decode_events(
    bytes: &[u8],
    offset: &mut usize,
    header: &TimeSeriesSessionHeader,
) -> Result<Vec<GrindEvent>, DecodeError> {
    let session_id = header.session_id;
    let mut events = Vec::with_capacity(usize::from(header.event_count));
    let mut expected_seq: u32 = 0;

    for index in 0..header.event_count {
        let truncated = || DecodeError::TruncatedEvent {
            index,
            offset: *offset as u64,
            len: bytes.len() as u64,
        };
        let slot = bytes
            .get(*offset..*offset + EVENT_SIZE)
            .ok_or_else(truncated)?;
        let event = parse_fixed(slot, |input| records::event_record(input, session_id))
            .ok_or_else(truncated)?;
        *offset += EVENT_SIZE;

        if is_event_sentinel(&event) {
            expected_seq += 1;
            continue;
        }
        if u32::from(event.event_sequence_id) != expected_seq {
            return Err(DecodeError::EventSequenceOutOfOrder {
                index,
                expected: expected_seq,
                found: event.event_sequence_id,
            });
        }
        events.push(event);
        expected_seq += 1;
    }

    Ok(events)
}

/// Measurement sequence ids are advisory: a mismatch is flagged on the
/// record and reported as a warning.
fn decode_measurements(
    bytes: &[u8],
    offset: &mut usize,
    header: &TimeSeriesSessionHeader,
    warnings: &mut Vec<DecodeWarning>,
) -> Result<Vec<GrindMeasurement>, DecodeError> {
    let session_id = header.session_id;
    let mut measurements = Vec::with_capacity(usize::from(header.measurement_count));
    let mut expected_seq: u32 = 0;

    for index in 0..header.measurement_count {
        let truncated = || DecodeError::TruncatedMeasurement {
            index,
            offset: *offset as u64,
            len: bytes.len() as u64,
        };
        let slot = bytes
            .get(*offset..*offset + MEASUREMENT_SIZE)
            .ok_or_else(truncated)?;
        let mut measurement =
            parse_fixed(slot, |input| records::measurement_record(input, session_id))
                .ok_or_else(truncated)?;
        *offset += MEASUREMENT_SIZE;

        if is_measurement_sentinel(&measurement) {
            expected_seq += 1;
            continue;
        }
        if u32::from(measurement.sequence_id) != expected_seq {
            let warning = DecodeWarning::MeasurementSequenceGap {
                session_id,
                index,
                expected: expected_seq,
                found: measurement.sequence_id,
            };
            warn!("{warning}");
            warnings.push(warning);
            measurement.out_of_sequence = true;
        }
        measurements.push(measurement);
        expected_seq += 1;
    }

    Ok(measurements)
}

fn check_count(record: RecordKind, emitted: usize, declared: u16) -> Result<(), DecodeError> {
    debug_assert!(
        emitted <= usize::from(declared),
        "{record}: emitted {emitted} of {declared} declared"
    );
    if emitted > usize::from(declared) {
        return Err(DecodeError::CountOverflow {
            record,
            emitted: emitted as u64,
            declared,
        });
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_decode_simple_file() {
        let bytes = simple_session_file(7);
        let decoded = decode_session_file(&bytes, 7).unwrap();

        assert_eq!(decoded.header.session_id, 7);
        assert_eq!(decoded.session.session_id, 7);
        assert_eq!(decoded.session.result_status, "COMPLETED");
        assert_eq!(decoded.session.total_time_ms, 4_200);
        assert_eq!(decoded.events.len(), 3);
        assert_eq!(decoded.measurements.len(), 4);
        assert!(decoded.warnings.is_empty());

        let ids: Vec<u16> = decoded.events.iter().map(|e| e.event_sequence_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(decoded.events.iter().all(|e| e.session_id == 7));
        assert!(decoded.measurements.iter().all(|m| !m.out_of_sequence));
        assert!(decoded.measurements[0].motor_is_on);
    }

    #[test]
    fn test_decode_is_deterministic() {
        let bytes = simple_session_file(3);
        let first = decode_session_file(&bytes, 3).unwrap();
        let second = decode_session_file(&bytes, 3).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_frame_too_short() {
        let bytes = simple_session_file(1);
        let err = decode_session_file(&bytes[..HEADER_SIZE + SESSION_SIZE - 1], 1).unwrap_err();
        assert_eq!(
            err,
            DecodeError::FrameTooShort {
                len: 103,
                required: 104
            }
        );
    }

    #[test]
    fn test_header_session_id_mismatch() {
        let bytes = simple_session_file(8);
        let err = decode_session_file(&bytes, 7).unwrap_err();
        assert_eq!(
            err,
            DecodeError::SessionIdMismatch {
                record: RecordKind::Header,
                expected: 7,
                found: 8
            }
        );
    }

    #[test]
    fn test_session_record_id_mismatch() {
        let mut bytes = header_bytes(7, 0, 0, SUPPORTED_SCHEMA_VERSION);
        bytes.extend(session_bytes(70));
        let err = decode_session_file(&bytes, 7).unwrap_err();
        assert_eq!(
            err,
            DecodeError::SessionIdMismatch {
                record: RecordKind::Session,
                expected: 7,
                found: 70
            }
        );
    }

    #[test]
    fn test_schema_mismatch_is_warning() {
        let mut bytes = header_bytes(5, 0, 0, 3);
        bytes.extend(session_bytes(5));
        let decoded = decode_session_file(&bytes, 5).unwrap();
        assert_eq!(
            decoded.warnings,
            vec![DecodeWarning::SchemaVersionMismatch {
                session_id: 5,
                found: 3,
                supported: SUPPORTED_SCHEMA_VERSION
            }]
        );
    }

    #[test]
    fn test_declared_size_mismatch_is_warning() {
        let mut bytes = simple_session_file(5);
        bytes[8..12].copy_from_slice(&12u32.to_le_bytes());
        let decoded = decode_session_file(&bytes, 5).unwrap();
        assert!(matches!(
            decoded.warnings.as_slice(),
            [DecodeWarning::DeclaredSizeMismatch { declared: 12, .. }]
        ));
        assert_eq!(decoded.events.len(), 3);
    }

    #[test]
    fn test_sentinel_events_consume_sequence() {
        let bytes = session_file(
            11,
            &[EventSlot::sentinel(), EventSlot::sentinel(), EventSlot::valid(2)],
            &[],
        );
        let decoded = decode_session_file(&bytes, 11).unwrap();
        assert_eq!(decoded.events.len(), 1);
        assert_eq!(decoded.events[0].event_sequence_id, 2);
    }

    #[test]
    fn test_phase_sentinel_event_skipped() {
        let mut sentinel = EventSlot::valid(1);
        sentinel.phase_id = 0xFF;
        let bytes = session_file(11, &[EventSlot::valid(0), sentinel, EventSlot::valid(2)], &[]);
        let decoded = decode_session_file(&bytes, 11).unwrap();
        let ids: Vec<u16> = decoded.events.iter().map(|e| e.event_sequence_id).collect();
        assert_eq!(ids, vec![0, 2]);
    }

    #[test]
    fn test_event_sequence_out_of_order() {
        let bytes = session_file(
            2,
            &[EventSlot::valid(0), EventSlot::valid(5), EventSlot::valid(2)],
            &[],
        );
        let err = decode_session_file(&bytes, 2).unwrap_err();
        assert_eq!(
            err,
            DecodeError::EventSequenceOutOfOrder {
                index: 1,
                expected: 1,
                found: 5
            }
        );
    }

    #[test]
    fn test_sentinel_does_not_excuse_following_gap() {
        // The sentinel at slot 0 still consumes sequence 0.
        let bytes = session_file(2, &[EventSlot::sentinel(), EventSlot::valid(0)], &[]);
        let err = decode_session_file(&bytes, 2).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::EventSequenceOutOfOrder {
                index: 1,
                expected: 1,
                found: 0
            }
        ));
    }

    #[test]
    fn test_truncated_event() {
        let bytes = simple_session_file(4);
        let cut = HEADER_SIZE + SESSION_SIZE + EVENT_SIZE + 10;
        let err = decode_session_file(&bytes[..cut], 4).unwrap_err();
        assert_eq!(
            err,
            DecodeError::TruncatedEvent {
                index: 1,
                offset: (HEADER_SIZE + SESSION_SIZE + EVENT_SIZE) as u64,
                len: cut as u64
            }
        );
    }

    #[test]
    fn test_truncated_measurement() {
        let bytes = simple_session_file(4);
        let err = decode_session_file(&bytes[..bytes.len() - 1], 4).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::TruncatedMeasurement { index: 3, .. }
        ));
    }

    #[test]
    fn test_measurement_gap_is_advisory() {
        let bytes = session_file(
            6,
            &[],
            &[
                MeasurementSlot::valid(0),
                MeasurementSlot::valid(4),
                MeasurementSlot::valid(2),
            ],
        );
        let decoded = decode_session_file(&bytes, 6).unwrap();
        assert_eq!(decoded.measurements.len(), 3);
        let flags: Vec<bool> = decoded
            .measurements
            .iter()
            .map(|m| m.out_of_sequence)
            .collect();
        assert_eq!(flags, vec![false, true, false]);
        assert_eq!(
            decoded.warnings,
            vec![DecodeWarning::MeasurementSequenceGap {
                session_id: 6,
                index: 1,
                expected: 1,
                found: 4
            }]
        );
    }

    #[test]
    fn test_sentinel_measurements_skipped() {
        let mut timestamp_sentinel = MeasurementSlot::valid(2);
        timestamp_sentinel.timestamp_ms = MEASUREMENT_SENTINEL_TIMESTAMP;
        let bytes = session_file(
            6,
            &[],
            &[
                MeasurementSlot::valid(0),
                MeasurementSlot::sentinel(),
                timestamp_sentinel,
                MeasurementSlot::valid(3),
            ],
        );
        let decoded = decode_session_file(&bytes, 6).unwrap();
        let ids: Vec<u16> = decoded.measurements.iter().map(|m| m.sequence_id).collect();
        assert_eq!(ids, vec![0, 3]);
        assert!(decoded.warnings.is_empty());
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut bytes = simple_session_file(9);
        bytes.extend_from_slice(&[0xAA; 7]);
        let decoded = decode_session_file(&bytes, 9).unwrap();
        assert_eq!(decoded.measurements.len(), 4);
    }

    #[test]
    fn test_check_count_accepts_bounds() {
        assert!(check_count(RecordKind::Event, 0, 0).is_ok());
        assert!(check_count(RecordKind::Event, 3, 3).is_ok());
    }
}
