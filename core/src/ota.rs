//! Host side of the firmware update handshake.
//!
//! ```text
//! Idle --START--> (wait Receiving) --data chunks--> END --> (wait Success)
//! ```
//!
//! The device reports its state on the status characteristic. The host only
//! ever waits for a specific state or an error, each with its own timeout.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::ble::{Characteristic, GattLink};
use crate::codec::encode_start_frame;
use crate::config::OtaConfig;
use crate::error::{LinkError, OtaError};
use crate::models::UpdatePayload;
use crate::protocol::{OtaSessionState, NO_BUILD_NUMBER, OTA_CMD_ABORT, OTA_CMD_END};

/// Read the build number the device reports, if it knows one.
pub async fn read_device_build<L: GattLink>(link: &L) -> Result<Option<String>, LinkError> {
    let raw = link.read(Characteristic::OtaBuildNumber).await?;
    let text = String::from_utf8_lossy(&raw);
    let build = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if build.is_empty() || build == NO_BUILD_NUMBER {
        debug!("device reports no build number");
        return Ok(None);
    }
    Ok(Some(build.to_string()))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OtaProgress {
    pub bytes_sent: u64,
    pub total_bytes: u64,
}

impl OtaProgress {
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.bytes_sent as f64 / self.total_bytes as f64
    }
}

/// How a transfer that did not fail ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OtaOutcome {
    /// The device confirmed the update was applied.
    Success,
    /// The device went away after END without confirming. It usually
    /// rebooted into the new image; reconnect and compare build numbers.
    AppliedUnconfirmed,
}

enum StatusWait {
    Reached(OtaSessionState),
    TimedOut,
    Cancelled,
}

/// One OTA attempt over a borrowed link. Not reusable.
pub struct OtaTransfer<'a, L: GattLink> {
    link: &'a mut L,
    config: OtaConfig,
    status_tx: Arc<watch::Sender<Option<OtaSessionState>>>,
    status_rx: watch::Receiver<Option<OtaSessionState>>,
    state: OtaSessionState,
    started: bool,
    outcome: Option<OtaOutcome>,
    cancel: CancellationToken,
}

impl<'a, L: GattLink> OtaTransfer<'a, L> {
    /// Subscribe to the status characteristic and return an idle transfer.
    pub async fn attach(link: &'a mut L, config: OtaConfig) -> Result<Self, OtaError> {
        let (tx, status_rx) = watch::channel(None);
        let status_tx = Arc::new(tx);
        let handler_tx = status_tx.clone();
        link.subscribe(
            Characteristic::OtaStatus,
            Arc::new(move |data: &[u8]| {
                if let Some(&byte) = data.first() {
                    let state = OtaSessionState::from_byte(byte);
                    debug!("ota status notification: {}", state);
                    handler_tx.send_replace(Some(state));
                }
            }),
        )
        .await?;

        Ok(Self {
            link,
            config,
            status_tx,
            status_rx,
            state: OtaSessionState::Idle,
            started: false,
            outcome: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that aborts the transfer when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Last known device state. An unconfirmed apply also ends in
    /// `Success`; [`Self::outcome`] tells the two apart.
    pub fn state(&self) -> OtaSessionState {
        self.state
    }

    pub fn outcome(&self) -> Option<OtaOutcome> {
        self.outcome
    }

    fn finish(&mut self, outcome: OtaOutcome) -> OtaOutcome {
        self.state = OtaSessionState::Success;
        self.outcome = Some(outcome);
        outcome
    }

    /// Run the whole handshake for `payload`, reporting progress after
    /// every data chunk the link accepted.
    pub async fn start<F>(
        &mut self,
        payload: &UpdatePayload,
        mut on_progress: F,
    ) -> Result<OtaOutcome, OtaError>
    where
        F: FnMut(OtaProgress),
    {
        if self.started {
            return Err(OtaError::SessionAlreadyUsed { state: self.state });
        }
        if payload.bytes.is_empty() {
            return Err(OtaError::EmptyPayload);
        }
        self.started = true;

        info!(
            "starting {} update: {} bytes, expected build {:?}",
            if payload.is_full { "full" } else { "delta" },
            payload.size,
            payload.expected_build
        );

        // A status left over from an earlier session must not satisfy the wait.
        self.status_tx.send_replace(None);
        let frame = encode_start_frame(
            payload.size,
            payload.is_full,
            payload.expected_build.as_deref(),
        );
        if let Err(e) = self.link.write(Characteristic::OtaControl, &frame).await {
            self.state = OtaSessionState::Error;
            return Err(e.into());
        }
        self.state = OtaSessionState::Ready;

        let start_timeout = self.config.start_timeout();
        match self
            .wait_for_status(OtaSessionState::Receiving, start_timeout)
            .await
        {
            StatusWait::Reached(OtaSessionState::Receiving) => {
                self.state = OtaSessionState::Receiving;
            }
            StatusWait::Reached(_) => {
                self.state = OtaSessionState::Error;
                return Err(OtaError::DeviceRejected);
            }
            StatusWait::TimedOut => {
                self.abort().await;
                return Err(OtaError::StartTimeout {
                    waited_ms: self.config.start_timeout_ms,
                });
            }
            StatusWait::Cancelled => return Err(self.cancelled().await),
        }

        self.stream(&payload.bytes, &mut on_progress).await?;

        info!("all {} bytes sent, finalizing", payload.bytes.len());
        if let Err(e) = self.link.write(Characteristic::OtaControl, &[OTA_CMD_END]).await {
            if e.is_disconnect() {
                warn!("device dropped the link on END ({}); assuming it rebooted", e);
                return Ok(self.finish(OtaOutcome::AppliedUnconfirmed));
            }
            self.state = OtaSessionState::Error;
            return Err(e.into());
        }

        let apply_timeout = self.config.apply_timeout();
        match self
            .wait_for_status(OtaSessionState::Success, apply_timeout)
            .await
        {
            StatusWait::Reached(OtaSessionState::Success) => {
                info!("device confirmed the update");
                Ok(self.finish(OtaOutcome::Success))
            }
            StatusWait::Reached(_) => {
                self.state = OtaSessionState::Error;
                Err(OtaError::ApplyFailed)
            }
            StatusWait::TimedOut => {
                warn!(
                    "no confirmation within {} ms; device may have rebooted",
                    self.config.apply_timeout_ms
                );
                Ok(self.finish(OtaOutcome::AppliedUnconfirmed))
            }
            StatusWait::Cancelled => Err(self.cancelled().await),
        }
    }

    async fn stream<F>(&mut self, bytes: &[u8], on_progress: &mut F) -> Result<(), OtaError>
    where
        F: FnMut(OtaProgress),
    {
        let total_bytes = bytes.len() as u64;
        let chunk_delay = self.config.chunk_delay();
        let mut bytes_sent = 0u64;

        for chunk in bytes.chunks(self.config.chunk_size.max(1)) {
            let written = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = self.link.write(Characteristic::OtaData, chunk) => Some(result),
            };
            match written {
                None => return Err(self.cancelled().await),
                Some(Err(cause)) => {
                    warn!("data write failed at offset {}: {}", bytes_sent, cause);
                    self.abort().await;
                    return Err(OtaError::TransferAborted {
                        offset: bytes_sent,
                        cause,
                    });
                }
                Some(Ok(())) => {}
            }

            bytes_sent += chunk.len() as u64;
            on_progress(OtaProgress {
                bytes_sent,
                total_bytes,
            });

            if *self.status_rx.borrow() == Some(OtaSessionState::Error) {
                warn!("device reported an error at offset {}", bytes_sent);
                self.abort().await;
                return Err(OtaError::DeviceError { offset: bytes_sent });
            }

            if bytes_sent < total_bytes && !chunk_delay.is_zero() {
                let cancelled = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => true,
                    _ = tokio::time::sleep(chunk_delay) => false,
                };
                if cancelled {
                    return Err(self.cancelled().await);
                }
            }
        }
        Ok(())
    }

    /// Wait until the device reports `target` or Error.
    async fn wait_for_status(&mut self, target: OtaSessionState, limit: Duration) -> StatusWait {
        let cancel = self.cancel.clone();
        let rx = &mut self.status_rx;
        let wait = rx.wait_for(|status| {
            matches!(status, Some(s) if *s == target || *s == OtaSessionState::Error)
        });
        tokio::select! {
            biased;
            _ = cancel.cancelled() => StatusWait::Cancelled,
            result = tokio::time::timeout(limit, wait) => match result {
                Ok(Ok(status)) => match *status {
                    Some(state) => StatusWait::Reached(state),
                    None => StatusWait::TimedOut,
                },
                // The sender lives as long as the transfer.
                Ok(Err(_)) | Err(_) => StatusWait::TimedOut,
            },
        }
    }

    /// Best-effort ABORT; the transfer is already failing.
    async fn abort(&mut self) {
        self.state = OtaSessionState::Error;
        if let Err(e) = self.link.write(Characteristic::OtaControl, &[OTA_CMD_ABORT]).await {
            warn!("failed to send ABORT: {}", e);
        }
    }

    async fn cancelled(&mut self) -> OtaError {
        info!("ota cancelled");
        self.abort().await;
        OtaError::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble_mock::{EndResponse, MockDevice, MockGattLink, StartResponse};
    use crate::protocol::OTA_CMD_START;

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn payload(len: usize) -> UpdatePayload {
        UpdatePayload {
            bytes: (0..len).map(|i| i as u8).collect(),
            is_full: true,
            size: len as u32,
            expected_build: Some("142".to_string()),
            full_reason: None,
        }
    }

    fn control_commands(link: &MockGattLink) -> Vec<u8> {
        link.writes_to(Characteristic::OtaControl)
            .iter()
            .map(|frame| frame[0])
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_update_succeeds() {
        init_logs();
        let mut link = MockGattLink::new(MockDevice::default());
        let mut progress = Vec::new();
        let outcome = {
            let mut ota = OtaTransfer::attach(&mut link, OtaConfig::default())
                .await
                .unwrap();
            let outcome = ota
                .start(&payload(10_000), |p| progress.push(p))
                .await
                .unwrap();
            assert_eq!(ota.state(), OtaSessionState::Success);
            outcome
        };
        assert_eq!(outcome, OtaOutcome::Success);

        let data = link.writes_to(Characteristic::OtaData);
        assert_eq!(data.len(), 20);
        assert!(data[..19].iter().all(|chunk| chunk.len() == 512));
        assert_eq!(data[19].len(), 10_000 - 19 * 512);
        assert_eq!(data.concat(), payload(10_000).bytes);

        assert_eq!(progress.len(), 20);
        assert!(progress[..19].iter().all(|p| p.fraction() < 1.0));
        assert_eq!(progress[19].fraction(), 1.0);
        assert!(progress.windows(2).all(|w| w[0].bytes_sent < w[1].bytes_sent));

        assert_eq!(control_commands(&link), vec![OTA_CMD_START, OTA_CMD_END]);
        let start = &link.writes_to(Characteristic::OtaControl)[0];
        assert_eq!(&start[1..5], &10_000u32.to_le_bytes());
        assert_eq!(start[5], 1);
        assert_eq!(&start[7..], b"142");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_timeout_sends_no_data() {
        let mut link = MockGattLink::new(MockDevice {
            start_response: StartResponse::Silent,
            ..MockDevice::default()
        });
        let err = {
            let mut ota = OtaTransfer::attach(&mut link, OtaConfig::default())
                .await
                .unwrap();
            let err = ota.start(&payload(1024), |_| {}).await.unwrap_err();
            assert_eq!(ota.state(), OtaSessionState::Error);
            err
        };
        assert_eq!(err, OtaError::StartTimeout { waited_ms: 15_000 });
        assert!(link.writes_to(Characteristic::OtaData).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_rejects_start() {
        let mut link = MockGattLink::new(MockDevice {
            start_response: StartResponse::Reject,
            ..MockDevice::default()
        });
        let mut ota = OtaTransfer::attach(&mut link, OtaConfig::default())
            .await
            .unwrap();
        let err = ota.start(&payload(1024), |_| {}).await.unwrap_err();
        assert_eq!(err, OtaError::DeviceRejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_aborts() {
        init_logs();
        let mut link = MockGattLink::new(MockDevice {
            fail_data_write_at: Some(3),
            ..MockDevice::default()
        });
        let err = {
            let mut ota = OtaTransfer::attach(&mut link, OtaConfig::default())
                .await
                .unwrap();
            ota.start(&payload(4096), |_| {}).await.unwrap_err()
        };
        match err {
            OtaError::TransferAborted { offset, .. } => assert_eq!(offset, 1024),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(control_commands(&link), vec![OTA_CMD_START, OTA_CMD_ABORT]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_error_mid_stream() {
        let mut link = MockGattLink::new(MockDevice {
            error_status_after_write: Some(2),
            ..MockDevice::default()
        });
        let err = {
            let mut ota = OtaTransfer::attach(&mut link, OtaConfig::default())
                .await
                .unwrap();
            ota.start(&payload(4096), |_| {}).await.unwrap_err()
        };
        assert_eq!(err, OtaError::DeviceError { offset: 1024 });
        assert_eq!(link.writes_to(Characteristic::OtaData).len(), 2);
        assert_eq!(control_commands(&link), vec![OTA_CMD_START, OTA_CMD_ABORT]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_confirmation_is_unconfirmed() {
        let mut link = MockGattLink::new(MockDevice {
            end_response: EndResponse::Silent,
            ..MockDevice::default()
        });
        let mut ota = OtaTransfer::attach(&mut link, OtaConfig::default())
            .await
            .unwrap();
        let outcome = ota.start(&payload(600), |_| {}).await.unwrap();
        assert_eq!(outcome, OtaOutcome::AppliedUnconfirmed);
        assert!(ota.state().is_terminal());
        assert_eq!(ota.outcome(), Some(OtaOutcome::AppliedUnconfirmed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_on_end_is_unconfirmed() {
        let mut link = MockGattLink::new(MockDevice {
            end_response: EndResponse::Disconnect,
            ..MockDevice::default()
        });
        let mut ota = OtaTransfer::attach(&mut link, OtaConfig::default())
            .await
            .unwrap();
        let outcome = ota.start(&payload(600), |_| {}).await.unwrap();
        assert_eq!(outcome, OtaOutcome::AppliedUnconfirmed);
        assert!(ota.state().is_terminal());
        assert_eq!(ota.outcome(), Some(OtaOutcome::AppliedUnconfirmed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_failure() {
        let mut link = MockGattLink::new(MockDevice {
            end_response: EndResponse::Error,
            ..MockDevice::default()
        });
        let mut ota = OtaTransfer::attach(&mut link, OtaConfig::default())
            .await
            .unwrap();
        let err = ota.start(&payload(600), |_| {}).await.unwrap_err();
        assert_eq!(err, OtaError::ApplyFailed);
        assert_eq!(ota.state(), OtaSessionState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_payload_rejected_before_start() {
        let mut link = MockGattLink::new(MockDevice::default());
        let err = {
            let mut ota = OtaTransfer::attach(&mut link, OtaConfig::default())
                .await
                .unwrap();
            ota.start(&payload(0), |_| {}).await.unwrap_err()
        };
        assert_eq!(err, OtaError::EmptyPayload);
        assert!(link.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transfer_is_single_use() {
        let mut link = MockGattLink::new(MockDevice::default());
        let mut ota = OtaTransfer::attach(&mut link, OtaConfig::default())
            .await
            .unwrap();
        ota.start(&payload(100), |_| {}).await.unwrap();
        let err = ota.start(&payload(100), |_| {}).await.unwrap_err();
        assert_eq!(
            err,
            OtaError::SessionAlreadyUsed {
                state: OtaSessionState::Success
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting_for_start() {
        let mut link = MockGattLink::new(MockDevice {
            start_response: StartResponse::Silent,
            ..MockDevice::default()
        });
        let err = {
            let mut ota = OtaTransfer::attach(&mut link, OtaConfig::default())
                .await
                .unwrap();
            let token = ota.cancellation_token();
            let body = payload(100);
            let (result, ()) = tokio::join!(ota.start(&body, |_| {}), async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                token.cancel();
            });
            result.unwrap_err()
        };
        assert_eq!(err, OtaError::Cancelled);
        assert_eq!(control_commands(&link), vec![OTA_CMD_START, OTA_CMD_ABORT]);
    }

    #[tokio::test]
    async fn test_read_device_build() {
        let link = MockGattLink::new(MockDevice {
            build_number: Some("142\n".to_string()),
            ..MockDevice::default()
        });
        assert_eq!(read_device_build(&link).await.unwrap(), Some("142".to_string()));

        let link = MockGattLink::new(MockDevice::default());
        assert_eq!(read_device_build(&link).await.unwrap(), None);
    }
}
