use nom::{
    bytes::complete::take,
    number::complete::{le_f32, le_i32, le_u16, le_u32, u8 as byte},
    IResult, Parser,
};

use crate::models::{GrindEvent, GrindMeasurement, GrindSession, TimeSeriesSessionHeader};

pub const HEADER_SIZE: usize = 24;
pub const SESSION_SIZE: usize = 80;
pub const EVENT_SIZE: usize = 44;
pub const MEASUREMENT_SIZE: usize = 24;

const RESERVED_SESSION_BYTES: usize = 3;
const RESULT_STATUS_LEN: usize = 16;

pub(crate) type Res<'a, T> = IResult<&'a [u8], T>;

pub fn header(input: &[u8]) -> Res<'_, TimeSeriesSessionHeader> {
    let (input, session_id) = le_u32(input)?;
    let (input, session_timestamp) = le_u32(input)?;
    let (input, declared_size) = le_u32(input)?;
    let (input, checksum) = le_u32(input)?;
    let (input, event_count) = le_u16(input)?;
    let (input, measurement_count) = le_u16(input)?;
    let (input, schema_version) = le_u16(input)?;
    let (input, reserved) = le_u16(input)?;
    Ok((
        input,
        TimeSeriesSessionHeader {
            session_id,
            session_timestamp,
            declared_size,
            checksum,
            event_count,
            measurement_count,
            schema_version,
            reserved,
        },
    ))
}

pub fn session_record(input: &[u8]) -> Res<'_, GrindSession> {
    let (input, session_id) = le_u32(input)?;
    let (input, session_timestamp) = le_u32(input)?;
    let (input, target_time_ms) = le_u32(input)?;
    let (input, total_time_ms) = le_u32(input)?;
    let (input, total_motor_on_time_ms) = le_u32(input)?;
    let (input, time_error_ms) = le_i32(input)?;

    let (input, target_weight) = le_f32(input)?;
    let (input, tolerance) = le_f32(input)?;
    let (input, final_weight) = le_f32(input)?;
    let (input, error_grams) = le_f32(input)?;
    let (input, start_weight) = le_f32(input)?;
    let (input, initial_motor_stop_offset) = le_f32(input)?;
    let (input, latency_to_coast_ratio) = le_f32(input)?;
    let (input, flow_rate_threshold) = le_f32(input)?;

    let (input, profile_id) = byte(input)?;
    let (input, grind_mode) = byte(input)?;
    let (input, max_pulse_attempts) = byte(input)?;
    let (input, pulse_count) = byte(input)?;
    let (input, termination_reason) = byte(input)?;
    let (input, _reserved) = take(RESERVED_SESSION_BYTES).parse(input)?;
    let (input, status) = take(RESULT_STATUS_LEN).parse(input)?;

    Ok((
        input,
        GrindSession {
            session_id,
            session_timestamp,
            target_time_ms,
            total_time_ms,
            total_motor_on_time_ms,
            time_error_ms,
            target_weight,
            tolerance,
            final_weight,
            error_grams,
            start_weight,
            initial_motor_stop_offset,
            latency_to_coast_ratio,
            flow_rate_threshold,
            profile_id,
            grind_mode,
            max_pulse_attempts,
            pulse_count,
            termination_reason,
            result_status: status_string(status),
        },
    ))
}

pub fn event_record(input: &[u8], session_id: u32) -> Res<'_, GrindEvent> {
    let (input, timestamp_ms) = le_u32(input)?;
    let (input, duration_ms) = le_u32(input)?;
    let (input, grind_latency_ms) = le_u32(input)?;
    let (input, settling_duration_ms) = le_u32(input)?;
    let (input, start_weight) = le_f32(input)?;
    let (input, end_weight) = le_f32(input)?;
    let (input, motor_stop_target_weight) = le_f32(input)?;
    let (input, pulse_duration_ms) = le_f32(input)?;
    let (input, pulse_flow_rate) = le_f32(input)?;
    let (input, event_sequence_id) = le_u16(input)?;
    let (input, loop_count) = le_u16(input)?;
    let (input, phase_id) = byte(input)?;
    let (input, pulse_attempt_number) = byte(input)?;
    let (input, event_flags) = byte(input)?;
    let (input, _reserved) = byte(input)?;

    Ok((
        input,
        GrindEvent {
            session_id,
            timestamp_ms,
            duration_ms,
            grind_latency_ms,
            settling_duration_ms,
            start_weight,
            end_weight,
            motor_stop_target_weight,
            pulse_duration_ms,
            pulse_flow_rate,
            event_sequence_id,
            loop_count,
            phase_id,
            pulse_attempt_number,
            event_flags,
        },
    ))
}

pub fn measurement_record(input: &[u8], session_id: u32) -> Res<'_, GrindMeasurement> {
    let (input, timestamp_ms) = le_u32(input)?;
    let (input, weight_grams) = le_f32(input)?;
    let (input, weight_delta) = le_f32(input)?;
    let (input, flow_rate_g_per_s) = le_f32(input)?;
    let (input, motor_stop_target_weight) = le_f32(input)?;
    let (input, sequence_id) = le_u16(input)?;
    let (input, motor_is_on) = byte(input)?;
    let (input, phase_id) = byte(input)?;

    Ok((
        input,
        GrindMeasurement {
            session_id,
            timestamp_ms,
            weight_grams,
            weight_delta,
            flow_rate_g_per_s,
            motor_stop_target_weight,
            sequence_id,
            motor_is_on: motor_is_on != 0,
            phase_id,
            out_of_sequence: false,
        },
    ))
}

/// Fixed-width C string: invalid UTF-8 replaced, trailing NULs dropped.
fn status_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&7u32.to_le_bytes());
        bytes.extend_from_slice(&1_700_000_000u32.to_le_bytes());
        bytes.extend_from_slice(&0x11223344u32.to_le_bytes());
        bytes.extend_from_slice(&0x55667788u32.to_le_bytes());
        bytes.extend_from_slice(&3u16.to_le_bytes());
        bytes.extend_from_slice(&10u16.to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        assert_eq!(bytes.len(), HEADER_SIZE);

        let (rest, h) = header(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(h.session_id, 7);
        assert_eq!(h.session_timestamp, 1_700_000_000);
        assert_eq!(h.declared_size, 0x11223344);
        assert_eq!(h.checksum, 0x55667788);
        assert_eq!(h.event_count, 3);
        assert_eq!(h.measurement_count, 10);
        assert_eq!(h.schema_version, 2);
    }

    #[test]
    fn test_session_record_offsets() {
        let mut bytes = vec![0u8; SESSION_SIZE];
        bytes[0..4].copy_from_slice(&42u32.to_le_bytes());
        bytes[20..24].copy_from_slice(&(-150i32).to_le_bytes());
        bytes[24..28].copy_from_slice(&18.0f32.to_le_bytes());
        bytes[32..36].copy_from_slice(&18.2f32.to_le_bytes());
        bytes[52..56].copy_from_slice(&0.5f32.to_le_bytes());
        bytes[56] = 2;
        bytes[57] = 1;
        bytes[59] = 3;
        bytes[60] = 2;
        bytes[64..72].copy_from_slice(b"OVERSHOT");

        let (rest, s) = session_record(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(s.session_id, 42);
        assert_eq!(s.time_error_ms, -150);
        assert_eq!(s.target_weight, 18.0);
        assert_eq!(s.final_weight, 18.2);
        assert_eq!(s.flow_rate_threshold, 0.5);
        assert_eq!(s.profile_id, 2);
        assert_eq!(s.grind_mode, 1);
        assert_eq!(s.pulse_count, 3);
        assert_eq!(s.termination_reason, 2);
        assert_eq!(s.result_status, "OVERSHOT");
    }

    #[test]
    fn test_status_string_lossy() {
        let mut raw = [0u8; RESULT_STATUS_LEN];
        raw[0] = b'O';
        raw[1] = b'K';
        raw[2] = 0xFF;
        assert_eq!(status_string(&raw), "OK\u{FFFD}");
        assert_eq!(status_string(&[0u8; RESULT_STATUS_LEN]), "");
    }

    #[test]
    fn test_short_input_is_error() {
        assert!(event_record(&[0u8; EVENT_SIZE - 1], 1).is_err());
        assert!(measurement_record(&[0u8; MEASUREMENT_SIZE - 1], 1).is_err());
        assert!(event_record(&[0u8; EVENT_SIZE], 1).is_ok());
    }
}
