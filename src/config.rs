//! Shard configuration.
//!
//! Every key is optional in the TOML form; missing keys take the values of
//! [`BarrelConfig::default`].
//!
//! ```toml
//! shard_id = "barrel-1"
//! worker_count = 16
//! queue_depth = 4096
//! checkpoint_interval_secs = 60
//! data_dir = "barrel-data"
//! max_retries = 5
//! retry_delay_ms = 1000
//! link_timeout_ms = 30000
//! delimiter = "|"
//! verbose = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::link::RetryPolicy;

/// Shortest checkpoint period accepted.
pub const MIN_CHECKPOINT_INTERVAL_SECS: u64 = 10;

/// Tunables of one shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BarrelConfig {
    /// Name under which the shard registers with the coordinator.
    pub shard_id: String,
    /// Ingestion worker threads.
    pub worker_count: usize,
    /// Capacity of the ingestion queue.
    pub queue_depth: usize,
    /// Seconds between periodic checkpoints.
    pub checkpoint_interval_secs: u64,
    /// Directory holding the checkpoint files.
    pub data_dir: PathBuf,
    /// Attempts per coordinator or peer call.
    pub max_retries: u32,
    /// Pause between attempts, in milliseconds.
    pub retry_delay_ms: u64,
    /// Deadline for one retried call, in milliseconds.
    pub link_timeout_ms: u64,
    /// Field separator of raw crawl messages.
    pub delimiter: char,
    /// Debug-level logging in the binary.
    pub verbose: bool,
}

impl Default for BarrelConfig {
    fn default() -> Self {
        Self {
            shard_id: "barrel-0".to_owned(),
            worker_count: 16,
            queue_depth: 4096,
            checkpoint_interval_secs: 60,
            data_dir: PathBuf::from("barrel-data"),
            max_retries: 5,
            retry_delay_ms: 1000,
            link_timeout_ms: 30_000,
            delimiter: '|',
            verbose: false,
        }
    }
}

impl BarrelConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Reject values the shard cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shard_id.is_empty() {
            return Err(ConfigError::Invalid("shard_id must not be empty".into()));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be positive".into()));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::Invalid("queue_depth must be positive".into()));
        }
        if self.checkpoint_interval_secs < MIN_CHECKPOINT_INTERVAL_SECS {
            return Err(ConfigError::Invalid(format!(
                "checkpoint_interval_secs must be at least {}, got {}",
                MIN_CHECKPOINT_INTERVAL_SECS, self.checkpoint_interval_secs
            )));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be positive".into()));
        }
        if self.link_timeout_ms == 0 {
            return Err(ConfigError::Invalid("link_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    /// Retry bounds for coordinator and peer calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries,
            delay: Duration::from_millis(self.retry_delay_ms),
            timeout: Duration::from_millis(self.link_timeout_ms),
        }
    }

    /// Period of the checkpoint thread.
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }
}
