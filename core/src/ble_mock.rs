use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::ble::{Characteristic, GattLink, NotifyHandler};
use crate::error::LinkError;
use crate::protocol::{
    ExportStatus, OtaSessionState, DATA_CMD_CLEAR_DATA, DATA_CMD_GET_COUNT,
    DATA_CMD_GET_FILE_LIST, DATA_CMD_REQUEST_FILE, DATA_CMD_STOP_EXPORT, NO_BUILD_NUMBER,
    OTA_CMD_ABORT, OTA_CMD_END, OTA_CMD_START,
};

/// Notification chunk size the firmware uses for file streaming.
pub const DEVICE_CHUNK_SIZE: usize = 500;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StartResponse {
    #[default]
    Receiving,
    Reject,
    Silent,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EndResponse {
    #[default]
    Success,
    Error,
    Silent,
    /// The device reboots before the END write is acknowledged.
    Disconnect,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileResponse {
    Bytes(Vec<u8>),
    /// A completion left over from an earlier request arrives first.
    StaleCompletionThen(Vec<u8>),
    /// The first half is streamed, then the transfer stalls. Until STOP the
    /// device ignores new requests, and the next one flushes the rest of
    /// this file instead.
    Stalled(Vec<u8>),
    Silent,
    DeviceError,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ListResponse {
    #[default]
    Normal,
    /// List chunks are sent but no completion status follows.
    NoCompletion,
    Silent,
    DeviceError,
}

/// Scripted grinder firmware behind a fake GATT link.
#[derive(Clone, Debug)]
pub struct MockDevice {
    pub build_number: Option<String>,
    pub start_response: StartResponse,
    pub end_response: EndResponse,
    /// 1-based index of the OTA data write that fails at the link layer.
    pub fail_data_write_at: Option<usize>,
    /// 1-based index of the OTA data write after which the device reports an error.
    pub error_status_after_write: Option<usize>,
    pub list_response: ListResponse,
    /// Overrides the advertised list; defaults to the keys of `files`.
    pub file_list: Option<Vec<u32>>,
    pub files: BTreeMap<u32, FileResponse>,
    pub chunk_size: usize,
    pub session_count: u16,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self {
            build_number: None,
            start_response: StartResponse::default(),
            end_response: EndResponse::default(),
            fail_data_write_at: None,
            error_status_after_write: None,
            list_response: ListResponse::default(),
            file_list: None,
            files: BTreeMap::new(),
            chunk_size: DEVICE_CHUNK_SIZE,
            session_count: 0,
        }
    }
}

impl MockDevice {
    pub fn with_files(files: impl IntoIterator<Item = (u32, Vec<u8>)>) -> Self {
        Self {
            files: files
                .into_iter()
                .map(|(id, bytes)| (id, FileResponse::Bytes(bytes)))
                .collect(),
            ..Self::default()
        }
    }

    fn advertised_ids(&self) -> Vec<u32> {
        self.file_list
            .clone()
            .unwrap_or_else(|| self.files.keys().copied().collect())
    }
}

#[derive(Default)]
struct MockState {
    disconnected: bool,
    handlers: HashMap<Characteristic, NotifyHandler>,
    writes: Vec<(Characteristic, Vec<u8>)>,
    ota_data_writes: usize,
    /// Unsent tail of a stalled file transfer.
    stalled: Option<Vec<u8>>,
}

#[derive(Default)]
pub struct MockGattLink {
    pub device: MockDevice,
    state: Mutex<MockState>,
}

impl MockGattLink {
    pub fn new(device: MockDevice) -> Self {
        Self {
            device,
            state: Mutex::new(MockState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn writes(&self) -> Vec<(Characteristic, Vec<u8>)> {
        self.state().writes.clone()
    }

    pub fn writes_to(&self, characteristic: Characteristic) -> Vec<Vec<u8>> {
        self.state()
            .writes
            .iter()
            .filter(|(c, _)| *c == characteristic)
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }

    pub fn disconnect(&self) {
        self.state().disconnected = true;
    }

    /// Deliver a notification as if the device had sent it.
    pub fn notify(&self, characteristic: Characteristic, data: &[u8]) {
        let handler = self.state().handlers.get(&characteristic).cloned();
        if let Some(handler) = handler {
            handler(data);
        }
    }

    fn ota_status(state: OtaSessionState) -> (Characteristic, Vec<u8>) {
        (Characteristic::OtaStatus, vec![state.to_byte()])
    }

    fn data_status(status: ExportStatus) -> (Characteristic, Vec<u8>) {
        (Characteristic::DataStatus, vec![status.to_byte()])
    }

    fn stream(&self, bytes: &[u8], out: &mut Vec<(Characteristic, Vec<u8>)>) {
        let total = bytes.len().max(1);
        let mut sent = 0;
        for chunk in bytes.chunks(self.device.chunk_size.max(1)) {
            sent += chunk.len();
            out.push((Characteristic::DataTransfer, chunk.to_vec()));
            let percent = (sent * 100 / total) as u8;
            out.push((
                Characteristic::DataStatus,
                vec![ExportStatus::Exporting.to_byte(), percent],
            ));
        }
    }

    /// The device's reaction to one write, as notifications to deliver.
    fn respond(
        &self,
        characteristic: Characteristic,
        bytes: &[u8],
    ) -> Result<Vec<(Characteristic, Vec<u8>)>, LinkError> {
        let mut out = Vec::new();
        let command = bytes.first().copied();
        match (characteristic, command) {
            (Characteristic::OtaControl, Some(OTA_CMD_START)) => match self.device.start_response {
                StartResponse::Receiving => out.push(Self::ota_status(OtaSessionState::Receiving)),
                StartResponse::Reject => out.push(Self::ota_status(OtaSessionState::Error)),
                StartResponse::Silent => {}
            },
            (Characteristic::OtaControl, Some(OTA_CMD_END)) => match self.device.end_response {
                EndResponse::Success => out.push(Self::ota_status(OtaSessionState::Success)),
                EndResponse::Error => out.push(Self::ota_status(OtaSessionState::Error)),
                EndResponse::Silent => {}
                EndResponse::Disconnect => {
                    self.state().disconnected = true;
                    return Err(LinkError::Disconnected);
                }
            },
            (Characteristic::OtaControl, Some(OTA_CMD_ABORT)) => {
                out.push(Self::ota_status(OtaSessionState::Error));
            }
            (Characteristic::OtaData, _) => {
                let count = {
                    let mut state = self.state();
                    state.ota_data_writes += 1;
                    state.ota_data_writes
                };
                if self.device.fail_data_write_at == Some(count) {
                    return Err(LinkError::WriteFailed {
                        characteristic,
                        message: "write not permitted".to_string(),
                    });
                }
                if self.device.error_status_after_write == Some(count) {
                    out.push(Self::ota_status(OtaSessionState::Error));
                }
            }
            (Characteristic::DataControl, Some(DATA_CMD_GET_FILE_LIST)) => {
                let ids = self.device.advertised_ids();
                let mut list = (ids.len() as u32).to_le_bytes().to_vec();
                for id in &ids {
                    list.extend_from_slice(&id.to_le_bytes());
                }
                match self.device.list_response {
                    ListResponse::Normal => {
                        for chunk in list.chunks(self.device.chunk_size.max(1)) {
                            out.push((Characteristic::DataTransfer, chunk.to_vec()));
                        }
                        out.push(Self::data_status(ExportStatus::Complete));
                    }
                    ListResponse::NoCompletion => {
                        for chunk in list.chunks(self.device.chunk_size.max(1)) {
                            out.push((Characteristic::DataTransfer, chunk.to_vec()));
                        }
                    }
                    ListResponse::Silent => {}
                    ListResponse::DeviceError => out.push(Self::data_status(ExportStatus::Error)),
                }
            }
            (Characteristic::DataControl, Some(DATA_CMD_REQUEST_FILE)) => {
                let stalled = self.state().stalled.take();
                if let Some(rest) = stalled {
                    self.stream(&rest, &mut out);
                    out.push(Self::data_status(ExportStatus::Complete));
                    return Ok(out);
                }
                let id = bytes
                    .get(1..5)
                    .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
                match id.and_then(|id| self.device.files.get(&id)) {
                    Some(FileResponse::Bytes(file)) => {
                        self.stream(file, &mut out);
                        out.push(Self::data_status(ExportStatus::Complete));
                    }
                    Some(FileResponse::StaleCompletionThen(file)) => {
                        out.push(Self::data_status(ExportStatus::Complete));
                        self.stream(file, &mut out);
                        out.push(Self::data_status(ExportStatus::Complete));
                    }
                    Some(FileResponse::Stalled(file)) => {
                        let (head, tail) = file.split_at(file.len() / 2);
                        self.stream(head, &mut out);
                        self.state().stalled = Some(tail.to_vec());
                    }
                    Some(FileResponse::Silent) => {}
                    Some(FileResponse::DeviceError) | None => {
                        out.push(Self::data_status(ExportStatus::Error));
                    }
                }
            }
            (Characteristic::DataControl, Some(DATA_CMD_GET_COUNT)) => {
                out.push((
                    Characteristic::DataStatus,
                    self.device.session_count.to_le_bytes().to_vec(),
                ));
            }
            (Characteristic::DataControl, Some(DATA_CMD_STOP_EXPORT)) => {
                self.state().stalled = None;
                out.push(Self::data_status(ExportStatus::Idle));
            }
            (Characteristic::DataControl, Some(DATA_CMD_CLEAR_DATA)) => {
                out.push(Self::data_status(ExportStatus::Idle));
            }
            _ => {}
        }
        Ok(out)
    }
}

impl GattLink for MockGattLink {
    async fn write(&self, characteristic: Characteristic, bytes: &[u8]) -> Result<(), LinkError> {
        {
            let mut state = self.state();
            if state.disconnected {
                return Err(LinkError::NotConnected);
            }
            state.writes.push((characteristic, bytes.to_vec()));
        }
        for (target, data) in self.respond(characteristic, bytes)? {
            self.notify(target, &data);
        }
        Ok(())
    }

    async fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>, LinkError> {
        if self.state().disconnected {
            return Err(LinkError::NotConnected);
        }
        match characteristic {
            Characteristic::OtaBuildNumber => Ok(self
                .device
                .build_number
                .as_deref()
                .unwrap_or(NO_BUILD_NUMBER)
                .as_bytes()
                .to_vec()),
            _ => Err(LinkError::ReadFailed {
                characteristic,
                message: "read not permitted".to_string(),
            }),
        }
    }

    async fn subscribe(
        &self,
        characteristic: Characteristic,
        handler: NotifyHandler,
    ) -> Result<(), LinkError> {
        let mut state = self.state();
        if state.disconnected {
            return Err(LinkError::NotConnected);
        }
        state.handlers.insert(characteristic, handler);
        Ok(())
    }
}
