//! Software device configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use prism_core::Result;
use prism_core::config::read_config;

fn default_name() -> String {
    "soft0".to_string()
}

fn default_pitch_alignment() -> usize {
    64
}

fn default_sync_timeout_ms() -> u64 {
    1000
}

/// Parameters of a [`SoftDevice`](crate::device::SoftDevice).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftDeviceConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Total bytes the device may hand out.  0 = unlimited.
    #[serde(default)]
    pub memory_limit_bytes: usize,
    /// Row pitch alignment of image surfaces, a power of two.
    #[serde(default = "default_pitch_alignment")]
    pub pitch_alignment: usize,
    /// Bound on fence waits issued by mappers.
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
}

impl Default for SoftDeviceConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            memory_limit_bytes: 0,
            pitch_alignment: default_pitch_alignment(),
            sync_timeout_ms: default_sync_timeout_ms(),
        }
    }
}

impl SoftDeviceConfig {
    pub fn from_json_str(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        Self::from_json_str(&read_config(path)?)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}
