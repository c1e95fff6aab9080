//! Foreign-language surface for the mobile companion apps.
//!
//! Only the pure codec is exported; the apps own the Bluetooth stack and
//! hand the received bytes over.

use crate::codec::{decode_session_file, parse_file_list};
use crate::error::DecodeError;
use crate::models::{DecodedSessionFile, GrindPhase};

#[uniffi::export]
pub fn decode_session_bytes(
    bytes: Vec<u8>,
    expected_session_id: u32,
) -> Result<DecodedSessionFile, DecodeError> {
    decode_session_file(&bytes, expected_session_id)
}

/// Session ids in device order, or `None` if the list is malformed.
#[uniffi::export]
pub fn parse_file_list_bytes(bytes: Vec<u8>) -> Option<Vec<u32>> {
    parse_file_list(&bytes).map(|list| list.session_ids)
}

#[uniffi::export]
pub fn grind_phase_name(phase_id: u8) -> String {
    GrindPhase::from_id(phase_id).name().to_string()
}

#[uniffi::export]
pub fn init_logging(verbose: bool) {
    crate::logging::init(verbose);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::fixtures::simple_session_file;

    #[test]
    fn test_decode_session_bytes() {
        let decoded = decode_session_bytes(simple_session_file(21), 21).unwrap();
        assert_eq!(decoded.session.session_id, 21);

        let err = decode_session_bytes(vec![0; 10], 21).unwrap_err();
        assert!(matches!(err, DecodeError::FrameTooShort { len: 10, .. }));
    }

    #[test]
    fn test_parse_file_list_bytes() {
        let bytes = [2u32, 7, 9]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect::<Vec<u8>>();
        assert_eq!(parse_file_list_bytes(bytes), Some(vec![7, 9]));
        assert_eq!(parse_file_list_bytes(vec![1, 0]), None);
    }

    #[test]
    fn test_grind_phase_name() {
        assert_eq!(grind_phase_name(12), GrindPhase::Completed.name());
    }
}
