use log::warn;
use nom::{multi::many0, number::complete::le_u32, Parser};

use super::records::Res;
use crate::models::SessionFileDescriptor;
use crate::protocol::{DATA_CMD_REQUEST_FILE, OTA_CMD_START};

/// `[START][u32 size LE][u8 is_full][u8 build_len][build bytes]`
pub fn encode_start_frame(size: u32, is_full: bool, build: Option<&str>) -> Vec<u8> {
    let build = build.unwrap_or_default().as_bytes();
    let build = match u8::try_from(build.len()) {
        Ok(_) => build,
        Err(_) => {
            warn!(
                "build string of {} bytes does not fit the start frame, omitting it",
                build.len()
            );
            &[]
        }
    };

    let mut frame = Vec::with_capacity(7 + build.len());
    frame.push(OTA_CMD_START);
    frame.extend_from_slice(&size.to_le_bytes());
    frame.push(u8::from(is_full));
    frame.push(build.len() as u8);
    frame.extend_from_slice(build);
    frame
}

pub fn encode_file_request(session_id: u32) -> [u8; 5] {
    let id = session_id.to_le_bytes();
    [DATA_CMD_REQUEST_FILE, id[0], id[1], id[2], id[3]]
}

/// A parsed `[u32 count][u32 session_id]*count` enumeration buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileList {
    pub declared_count: u32,
    pub session_ids: Vec<u32>,
}

impl FileList {
    pub fn is_complete(&self) -> bool {
        self.session_ids.len() as u64 == u64::from(self.declared_count)
    }

    pub fn descriptors(&self) -> Vec<SessionFileDescriptor> {
        self.session_ids
            .iter()
            .map(|&session_id| SessionFileDescriptor { session_id })
            .collect()
    }
}

fn file_list(input: &[u8]) -> Res<'_, (u32, Vec<u32>)> {
    let (input, count) = le_u32(input)?;
    let (input, ids) = many0(le_u32::<&[u8], nom::error::Error<&[u8]>>).parse(input)?;
    Ok((input, (count, ids)))
}

/// Parse an aggregated enumeration buffer.
///
/// Returns `None` if the buffer cannot even hold the count. A buffer
/// shorter than the count declares yields the ids that are present.
pub fn parse_file_list(bytes: &[u8]) -> Option<FileList> {
    let (_, (declared_count, mut session_ids)) = file_list(bytes).ok()?;
    session_ids.truncate(declared_count as usize);
    Some(FileList {
        declared_count,
        session_ids,
    })
}

/// True once the buffer holds every id its count declares.
pub fn file_list_satisfied(bytes: &[u8]) -> bool {
    let Some(count) = bytes.get(..4) else {
        return false;
    };
    let count = u32::from_le_bytes([count[0], count[1], count[2], count[3]]);
    bytes.len() as u64 >= 4 + 4 * u64::from(count)
}
