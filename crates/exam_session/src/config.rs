//! Runtime configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::queue::DEFAULT_MAX_RETRIES;

/// Errors reading or writing a configuration file
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Timer intervals and sync policy for a session runtime
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Clock tick period
    pub tick_interval_ms: u64,
    /// Quiet period before a remote progress write
    pub debounce_ms: u64,
    /// Pending-count refresh period
    pub queue_recount_ms: u64,
    /// Failed deliveries before a queued write is dropped
    pub max_retries: u32,
    /// Submit automatically when the clock runs out
    pub auto_submit_on_time_up: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            debounce_ms: 30_000,
            queue_recount_ms: 5_000,
            max_retries: DEFAULT_MAX_RETRIES,
            auto_submit_on_time_up: true,
        }
    }
}

impl RuntimeConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn queue_recount(&self) -> Duration {
        Duration::from_millis(self.queue_recount_ms.max(1))
    }

    pub fn with_debounce_ms(mut self, ms: u64) -> Self {
        self.debounce_ms = ms;
        self
    }

    pub fn with_tick_interval_ms(mut self, ms: u64) -> Self {
        self.tick_interval_ms = ms;
        self
    }

    pub fn with_queue_recount_ms(mut self, ms: u64) -> Self {
        self.queue_recount_ms = ms;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_auto_submit(mut self, enabled: bool) -> Self {
        self.auto_submit_on_time_up = enabled;
        self
    }

    /// Load from a JSON file
    ///
    /// A missing file yields the defaults; an unparsable one is logged and
    /// also yields the defaults.
    pub fn load_sync(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str::<RuntimeConfig>(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!("Failed to parse runtime config, using defaults: {}", e);
                Ok(Self::default())
            }
        }
    }

    /// Write as pretty JSON, creating parent directories
    pub fn save_sync(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
