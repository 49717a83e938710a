//! TOML configuration for wiring a shared-memory region.

use serde::Deserialize;
use std::path::Path;

/// Where a shared region lives and how big its data section is.
///
/// `capacity` covers the data region only; callers add the trailer length
/// of whichever buffer layout they are placing in the region.
#[derive(Deserialize, Debug, Clone)]
pub struct RegionConfig {
    #[serde(default = "defaults::path")]
    pub path: String,
    #[serde(default = "defaults::capacity")]
    pub capacity: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
}

mod defaults {
    pub fn path() -> String {
        "/tmp/basalt_bus".into()
    }

    pub fn capacity() -> usize {
        1 << 16 // 65536
    }
}

impl RegionConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config: RegionConfig = toml::from_str(&text)?;
        Ok(config)
    }
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            path: defaults::path(),
            capacity: defaults::capacity(),
        }
    }
}
