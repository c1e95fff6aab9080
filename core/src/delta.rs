//! Delta-vs-full update payload selection.
//!
//! The device always receives a patch: a delta against the image it is
//! running, or a patch from an empty image when a full update is needed.
//! The wire format is therefore the same either way.

use log::{debug, info};

use crate::config::DeltaConfig;
use crate::error::{PatchError, SelectError};
use crate::models::{FirmwareImage, FullUpdateReason, UpdatePayload};

/// External binary diff tool.
pub trait PatchTool {
    fn create_patch(&self, old: &[u8], new: &[u8]) -> Result<Vec<u8>, PatchError>;
}

/// Lookup of previously flashed images by build number.
pub trait FirmwareCache {
    fn lookup(&self, build: &str) -> Option<Vec<u8>>;
}

impl<F> PatchTool for F
where
    F: Fn(&[u8], &[u8]) -> Result<Vec<u8>, PatchError>,
{
    fn create_patch(&self, old: &[u8], new: &[u8]) -> Result<Vec<u8>, PatchError> {
        self(old, new)
    }
}

pub struct DeltaPatchSelector<'a, P: PatchTool, C: FirmwareCache> {
    tool: &'a P,
    cache: &'a C,
    max_patch_ratio: f64,
}

impl<'a, P: PatchTool, C: FirmwareCache> DeltaPatchSelector<'a, P, C> {
    pub fn new(tool: &'a P, cache: &'a C, config: &DeltaConfig) -> Self {
        Self {
            tool,
            cache,
            max_patch_ratio: config.max_patch_ratio,
        }
    }

    /// Build the payload for `new_firmware`.
    ///
    /// A diff tool failure is fatal; there is no fallback to a payload the
    /// tool did not produce.
    pub fn select(
        &self,
        new_firmware: &FirmwareImage,
        device_build: Option<&str>,
        force_full: bool,
    ) -> Result<UpdatePayload, SelectError> {
        if new_firmware.is_empty() {
            return Err(SelectError::EmptyFirmware);
        }

        let reason = if force_full {
            FullUpdateReason::Forced
        } else {
            match device_build {
                None => FullUpdateReason::NoDeviceBuild,
                Some(build) => match self.cache.lookup(build) {
                    None => FullUpdateReason::NoCachedFirmware,
                    Some(old) => {
                        let patch = self.tool.create_patch(&old, &new_firmware.bytes)?;
                        if self.is_beneficial(patch.len(), new_firmware.len()) {
                            info!(
                                "delta update from build {}: {} bytes ({:.0}% smaller)",
                                build,
                                patch.len(),
                                100.0 * (1.0 - patch.len() as f64 / new_firmware.len() as f64)
                            );
                            return payload(patch, false, new_firmware, None);
                        }
                        debug!(
                            "delta of {} bytes against build {} is not below {:.0}% of {}",
                            patch.len(),
                            build,
                            self.max_patch_ratio * 100.0,
                            new_firmware.len()
                        );
                        FullUpdateReason::DeltaNotBeneficial
                    }
                },
            }
        };

        let patch = self.tool.create_patch(&[], &new_firmware.bytes)?;
        info!("full update: {} bytes ({})", patch.len(), reason);
        payload(patch, true, new_firmware, Some(reason))
    }

    fn is_beneficial(&self, patch_len: usize, image_len: usize) -> bool {
        (patch_len as f64) < self.max_patch_ratio * image_len as f64
    }
}

fn payload(
    bytes: Vec<u8>,
    is_full: bool,
    image: &FirmwareImage,
    full_reason: Option<FullUpdateReason>,
) -> Result<UpdatePayload, SelectError> {
    let size = u32::try_from(bytes.len()).map_err(|_| SelectError::PayloadTooLarge {
        size: bytes.len() as u64,
    })?;
    Ok(UpdatePayload {
        bytes,
        is_full,
        size,
        expected_build: image.build.clone(),
        full_reason,
    })
}
