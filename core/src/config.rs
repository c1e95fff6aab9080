//! Tunables for the transfer state machines.
//!
//! Every field has a default, so a JSON file only needs to name the values
//! it changes.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    /// How long to wait for the device to start receiving after START.
    pub start_timeout_ms: u64,
    /// How long to wait for the apply confirmation after END.
    pub apply_timeout_ms: u64,
    /// Payload bytes per data characteristic write.
    pub chunk_size: usize,
    /// Pause between chunk writes.
    pub chunk_delay_ms: u64,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: 15_000,
            apply_timeout_ms: 30_000,
            chunk_size: 512,
            chunk_delay_ms: 10,
        }
    }
}

impl OtaConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub list_timeout_ms: u64,
    pub file_timeout_ms: u64,
    pub count_timeout_ms: u64,
    /// Keep the received bytes of files that fail to decode.
    pub keep_failed_raw: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            list_timeout_ms: 10_000,
            file_timeout_ms: 30_000,
            count_timeout_ms: 1_000,
            keep_failed_raw: true,
        }
    }
}

impl ExportConfig {
    pub fn list_timeout(&self) -> Duration {
        Duration::from_millis(self.list_timeout_ms)
    }

    pub fn file_timeout(&self) -> Duration {
        Duration::from_millis(self.file_timeout_ms)
    }

    pub fn count_timeout(&self) -> Duration {
        Duration::from_millis(self.count_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaConfig {
    /// A delta is only used if it is smaller than this fraction of the image.
    pub max_patch_ratio: f64,
    pub firmware_cache_dir: PathBuf,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            max_patch_ratio: 0.8,
            firmware_cache_dir: PathBuf::from("firmware_cache"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub ota: OtaConfig,
    pub export: ExportConfig,
    pub delta: DeltaConfig,
}

impl TransferConfig {
    pub fn from_json_str(contents: &str) -> Result<Self, ConfigError> {
        let config: TransferConfig = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|cause| ConfigError::Io {
            path: path.to_path_buf(),
            cause,
        })?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ota.chunk_size == 0 {
            return Err(ConfigError::Invalid("ota.chunk_size must be non-zero".into()));
        }
        let ratio = self.delta.max_patch_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "delta.max_patch_ratio must be in (0, 1], got {ratio}"
            )));
        }
        Ok(())
    }
}
