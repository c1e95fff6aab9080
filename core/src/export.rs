//! Bulk download of the grinder's session log files.
//!
//! Every request gets a fresh inbox that is installed before the control
//! write goes out, so chunks and status updates are only ever credited to
//! the request that is currently outstanding. A transfer ends when the
//! device reports Complete; a Complete that arrives before any data for the
//! current request is a leftover from the previous one and is ignored.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info, trace, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ble::{Characteristic, GattLink};
use crate::codec::{decode_session_file, encode_file_request, file_list_satisfied, parse_file_list};
use crate::config::ExportConfig;
use crate::error::{ExportError, FetchError};
use crate::models::{DecodedSessionFile, ExportResult, FailedSession, SessionFileDescriptor};
use crate::protocol::{
    DataStatusNotification, ExportStatus, DATA_CMD_CLEAR_DATA, DATA_CMD_GET_COUNT,
    DATA_CMD_GET_FILE_LIST, DATA_CMD_STOP_EXPORT,
};
use crate::storage::ExportSink;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportState {
    Idle,
    ListRequested,
    ListReceived,
    FileRequested(u32),
    FileReceived(u32),
    Done,
    Failed,
    Aborted,
}

/// Result of fetching one file. Failures never end the export.
#[derive(Clone, Debug, PartialEq)]
pub enum FileFetch {
    Decoded(DecodedSessionFile),
    Failed(FailedSession),
}

// ============================================================================
// Notification routing
// ============================================================================

#[derive(Debug)]
enum Inbound {
    Chunk(Vec<u8>),
    Status(DataStatusNotification),
}

/// Forwards notifications to the inbox of the outstanding request, if any.
#[derive(Clone, Default)]
struct InboxRouter {
    slot: Arc<Mutex<Option<mpsc::UnboundedSender<Inbound>>>>,
}

impl InboxRouter {
    fn slot(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Inbound>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self) -> mpsc::UnboundedReceiver<Inbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.slot() = Some(tx);
        rx
    }

    fn close(&self) {
        *self.slot() = None;
    }

    fn deliver(&self, message: Inbound) {
        match self.slot().as_ref() {
            Some(tx) => {
                let _ = tx.send(message);
            }
            None => trace!("dropping notification with no request outstanding: {:?}", message),
        }
    }
}

enum Reception {
    Complete(Vec<u8>),
    DeviceError(Vec<u8>),
    TimedOut(Vec<u8>),
    Cancelled,
}

// ============================================================================
// Export state machine
// ============================================================================

pub struct DataExport<'a, L: GattLink> {
    link: &'a mut L,
    config: ExportConfig,
    router: InboxRouter,
    state: ExportState,
    cancel: CancellationToken,
}

impl<'a, L: GattLink> DataExport<'a, L> {
    /// Subscribe to the transfer and status characteristics.
    pub async fn attach(link: &'a mut L, config: ExportConfig) -> Result<Self, ExportError> {
        let router = InboxRouter::default();

        let chunks = router.clone();
        link.subscribe(
            Characteristic::DataTransfer,
            Arc::new(move |data: &[u8]| chunks.deliver(Inbound::Chunk(data.to_vec()))),
        )
        .await?;

        let statuses = router.clone();
        link.subscribe(
            Characteristic::DataStatus,
            Arc::new(move |data: &[u8]| {
                statuses.deliver(Inbound::Status(DataStatusNotification::parse(data)))
            }),
        )
        .await?;

        Ok(Self {
            link,
            config,
            router,
            state: ExportState::Idle,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> ExportState {
        self.state
    }

    fn transition(&mut self, next: ExportState) {
        debug!("export state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Ask the device which session files it holds.
    pub async fn list_files(&mut self) -> Result<Vec<SessionFileDescriptor>, ExportError> {
        let mut inbox = self.router.open();
        self.transition(ExportState::ListRequested);
        if let Err(e) = self
            .link
            .write(Characteristic::DataControl, &[DATA_CMD_GET_FILE_LIST])
            .await
        {
            self.router.close();
            self.transition(ExportState::Failed);
            return Err(e.into());
        }

        let reception = self
            .receive(&mut inbox, self.config.list_timeout(), file_list_satisfied)
            .await;
        self.router.close();

        let buffer = match reception {
            Reception::Complete(buffer) => buffer,
            Reception::TimedOut(buffer) if !buffer.is_empty() => {
                warn!(
                    "file list not completed within {} ms, using {} bytes received",
                    self.config.list_timeout_ms,
                    buffer.len()
                );
                buffer
            }
            Reception::TimedOut(_) => {
                self.transition(ExportState::Failed);
                return Err(ExportError::FileListTimeout {
                    waited_ms: self.config.list_timeout_ms,
                });
            }
            Reception::DeviceError(_) => {
                self.transition(ExportState::Failed);
                return Err(ExportError::DeviceError);
            }
            Reception::Cancelled => return Err(self.cancelled().await),
        };

        let Some(list) = parse_file_list(&buffer) else {
            self.transition(ExportState::Failed);
            return Err(ExportError::MalformedFileList {
                len: buffer.len() as u64,
            });
        };
        if !list.is_complete() {
            warn!(
                "file list declares {} sessions but carries {}",
                list.declared_count,
                list.session_ids.len()
            );
        }
        info!("device holds {} session files", list.session_ids.len());
        self.transition(ExportState::ListReceived);
        Ok(list.descriptors())
    }

    /// Fetch and decode one session file.
    ///
    /// Only cancellation is returned as an error; everything else that can
    /// go wrong with a single file is reported as [`FileFetch::Failed`].
    pub async fn fetch_file(&mut self, session_id: u32) -> Result<FileFetch, ExportError> {
        let mut inbox = self.router.open();
        self.transition(ExportState::FileRequested(session_id));
        if let Err(cause) = self
            .link
            .write(Characteristic::DataControl, &encode_file_request(session_id))
            .await
        {
            self.router.close();
            self.transition(ExportState::ListReceived);
            return Ok(FileFetch::Failed(FailedSession {
                session_id,
                reason: FetchError::Link { session_id, cause },
                raw: None,
            }));
        }

        let reception = self
            .receive(&mut inbox, self.config.file_timeout(), |_| false)
            .await;
        self.router.close();

        let fetched = match reception {
            Reception::Complete(bytes) => {
                self.transition(ExportState::FileReceived(session_id));
                debug!("session {}: received {} bytes", session_id, bytes.len());
                match decode_session_file(&bytes, session_id) {
                    Ok(decoded) => FileFetch::Decoded(decoded),
                    Err(cause) => self.failure(FetchError::Decode { session_id, cause }, bytes),
                }
            }
            Reception::TimedOut(bytes) => {
                // The device ignores new requests until this transfer stops.
                self.stop_transfer().await;
                self.failure(
                    FetchError::FetchTimeout {
                        session_id,
                        waited_ms: self.config.file_timeout_ms,
                    },
                    bytes,
                )
            }
            Reception::DeviceError(bytes) => {
                self.failure(FetchError::DeviceError { session_id }, bytes)
            }
            Reception::Cancelled => return Err(self.cancelled().await),
        };
        self.transition(ExportState::ListReceived);
        Ok(fetched)
    }

    fn failure(&self, reason: FetchError, bytes: Vec<u8>) -> FileFetch {
        let raw = (self.config.keep_failed_raw && !bytes.is_empty()).then_some(bytes);
        FileFetch::Failed(FailedSession {
            session_id: reason.session_id(),
            reason,
            raw,
        })
    }

    /// Enumerate and fetch every session file.
    ///
    /// Fails only if the file list cannot be obtained or the export is
    /// cancelled. Per-file failures are collected in the result.
    pub async fn run(&mut self) -> Result<ExportResult, ExportError> {
        let descriptors = self.list_files().await?;
        let total = descriptors.len();
        let mut result = ExportResult::default();

        for (index, descriptor) in descriptors.iter().enumerate() {
            info!(
                "fetching session {} ({}/{})",
                descriptor.session_id,
                index + 1,
                total
            );
            match self.fetch_file(descriptor.session_id).await? {
                FileFetch::Decoded(decoded) => {
                    for warning in &decoded.warnings {
                        debug!("session {}: {}", descriptor.session_id, warning);
                    }
                    result.absorb(decoded);
                }
                FileFetch::Failed(failure) => {
                    warn!("skipping {}", failure.reason);
                    result.record_failure(failure);
                }
            }
        }

        self.transition(ExportState::Done);
        info!(
            "export finished: {} sessions, {} events, {} measurements, {} failed",
            result.sessions.len(),
            result.events.len(),
            result.measurements.len(),
            result.failed_session_ids.len()
        );
        Ok(result)
    }

    /// Run the export and hand a non-empty result to `sink`.
    pub async fn run_into<S: ExportSink>(&mut self, sink: &mut S) -> Result<ExportResult, ExportError> {
        let result = self.run().await?;
        if result.sessions.is_empty() {
            info!("nothing decoded, sink not called");
        } else {
            sink.persist(&result)?;
        }
        Ok(result)
    }

    /// Number of sessions the device reports holding.
    pub async fn session_count(&mut self) -> Result<u16, ExportError> {
        let mut inbox = self.router.open();
        if let Err(e) = self
            .link
            .write(Characteristic::DataControl, &[DATA_CMD_GET_COUNT])
            .await
        {
            self.router.close();
            return Err(e.into());
        }

        let deadline = tokio::time::sleep(self.config.count_timeout());
        tokio::pin!(deadline);
        let count = loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Err(ExportError::Cancelled),
                _ = &mut deadline => break Err(ExportError::SessionCountTimeout {
                    waited_ms: self.config.count_timeout_ms,
                }),
                message = inbox.recv() => message,
            };
            match message {
                Some(Inbound::Status(DataStatusNotification::SessionCount(count))) => break Ok(count),
                Some(other) => trace!("ignoring {:?} while waiting for session count", other),
                None => {
                    break Err(ExportError::SessionCountTimeout {
                        waited_ms: self.config.count_timeout_ms,
                    })
                }
            }
        };
        self.router.close();
        count
    }

    /// Erase every stored session on the device.
    pub async fn clear_stored_data(&mut self) -> Result<(), ExportError> {
        info!("clearing stored session data on device");
        self.link
            .write(Characteristic::DataControl, &[DATA_CMD_CLEAR_DATA])
            .await?;
        Ok(())
    }

    /// Tell the device to stop streaming.
    pub async fn stop(&mut self) -> Result<(), ExportError> {
        self.link
            .write(Characteristic::DataControl, &[DATA_CMD_STOP_EXPORT])
            .await?;
        Ok(())
    }

    /// Collect one transfer until Complete, Error, `done`, or the deadline.
    async fn receive(
        &self,
        inbox: &mut mpsc::UnboundedReceiver<Inbound>,
        limit: Duration,
        done: impl Fn(&[u8]) -> bool,
    ) -> Reception {
        let mut buffer = Vec::new();
        let mut received_data = false;
        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);

        loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Reception::Cancelled,
                _ = &mut deadline => return Reception::TimedOut(buffer),
                message = inbox.recv() => message,
            };
            match message {
                Some(Inbound::Chunk(data)) => {
                    received_data = true;
                    buffer.extend_from_slice(&data);
                    if done(&buffer) {
                        return Reception::Complete(buffer);
                    }
                }
                Some(Inbound::Status(DataStatusNotification::Status(ExportStatus::Complete))) => {
                    if received_data {
                        return Reception::Complete(buffer);
                    }
                    debug!("ignoring completion that arrived before any data");
                }
                Some(Inbound::Status(DataStatusNotification::Status(ExportStatus::Error))) => {
                    return Reception::DeviceError(buffer);
                }
                Some(Inbound::Status(DataStatusNotification::Progress(percent))) => {
                    trace!("transfer progress {}%", percent);
                }
                Some(other) => trace!("ignoring {:?}", other),
                None => return Reception::TimedOut(buffer),
            }
        }
    }

    /// Best-effort STOP; failures are logged only.
    async fn stop_transfer(&mut self) {
        if let Err(e) = self
            .link
            .write(Characteristic::DataControl, &[DATA_CMD_STOP_EXPORT])
            .await
        {
            warn!("failed to send STOP: {}", e);
        }
    }

    async fn cancelled(&mut self) -> ExportError {
        info!("export cancelled");
        self.router.close();
        self.stop_transfer().await;
        self.transition(ExportState::Aborted);
        ExportError::Cancelled
    }
}
