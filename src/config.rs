//! Engine Configuration
//!
//! Timeouts and intervals for the tunnel engine, loadable from a JSON file.
//! Every field has a default so a partial (or missing) file is valid.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bound on TCP dial plus SSH handshake and authentication
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Bound on a single keepalive round trip
    #[serde(default = "default_keepalive_timeout_secs")]
    pub keepalive_timeout_secs: u64,

    /// How often the handle owner checks for a transport dropped by the remote side
    #[serde(default = "default_close_poll_interval_ms")]
    pub close_poll_interval_ms: u64,

    /// Protocol keepalive interval handed to russh (None disables)
    #[serde(default = "default_ssh_keepalive_interval_secs")]
    pub ssh_keepalive_interval_secs: Option<u64>,

    /// Missed protocol keepalives before russh drops the connection
    #[serde(default = "default_ssh_keepalive_max")]
    pub ssh_keepalive_max: usize,

    /// Command queue depth of each handle owner task
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_keepalive_timeout_secs() -> u64 {
    5
}

fn default_close_poll_interval_ms() -> u64 {
    500
}

fn default_ssh_keepalive_interval_secs() -> Option<u64> {
    Some(30)
}

fn default_ssh_keepalive_max() -> usize {
    3
}

fn default_channel_buffer() -> usize {
    64
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            keepalive_timeout_secs: default_keepalive_timeout_secs(),
            close_poll_interval_ms: default_close_poll_interval_ms(),
            ssh_keepalive_interval_secs: default_ssh_keepalive_interval_secs(),
            ssh_keepalive_max: default_ssh_keepalive_max(),
            channel_buffer: default_channel_buffer(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file, falling back to defaults if it does not exist
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !tokio::fs::try_exists(path).await? {
            debug!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&content)?;
        info!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs)
    }

    pub fn close_poll_interval(&self) -> Duration {
        // A zero interval would make tokio::time::interval panic
        Duration::from_millis(self.close_poll_interval_ms.max(1))
    }

    pub fn ssh_keepalive_interval(&self) -> Option<Duration> {
        self.ssh_keepalive_interval_secs.map(Duration::from_secs)
    }
}
