//! Service configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::token::DEFAULT_TOKEN_LENGTH;

/// Settings for the `stratum-topo` service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Directory of the topology log. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Seconds between chunkserver state flushes.
    pub state_flush_interval_secs: u64,
    /// Length of issued chunkserver tokens.
    pub token_length: usize,
    /// Rewrite the log to live keys only after loading it.
    pub compact_on_start: bool,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            state_flush_interval_secs: 60,
            token_length: DEFAULT_TOKEN_LENGTH,
            compact_on_start: false,
        }
    }
}

impl TopologyConfig {
    /// Loads a config from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Flush interval as a `Duration`, never shorter than one second.
    pub fn state_flush_interval(&self) -> Duration {
        Duration::from_secs(self.state_flush_interval_secs.max(1))
    }
}
