//! Serializable mapper options.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PrismError, Result};

/// What a mapping cache does when asked to reissue a destination that is
/// still referenced outside the cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolPolicy {
    /// Refuse with [`PrismError::PoolContractViolation`].
    #[default]
    Strict,
    /// Reissue anyway and log a warning.
    Reissue,
}

/// Options for [`create_mapper`](crate::factory::create_mapper).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapperOptions {
    /// Wrap the resolved mapper in a
    /// [`MemoryMapperCache`](crate::cache::MemoryMapperCache).  Only sound
    /// when sources come from a fixed pool whose handles always denote the
    /// same memory.
    #[serde(default)]
    pub use_cache: bool,
    #[serde(default)]
    pub pool_policy: PoolPolicy,
}

impl MapperOptions {
    pub fn cached() -> Self {
        Self {
            use_cache: true,
            ..Self::default()
        }
    }

    /// Policy of the cache these options ask for, `None` when uncached.
    pub fn cache_policy(&self) -> Option<PoolPolicy> {
        self.use_cache.then_some(self.pool_policy)
    }

    pub fn from_json_str(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        Self::from_json_str(&read_config(path)?)
    }
}

/// Read a configuration file, naming the path on failure.
pub fn read_config(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|err| {
        PrismError::Config(format!(
            "Failed to read configuration from {}: {err}",
            path.display()
        ))
    })
}
