//! Engine configuration
//!
//! `EngineConfig` holds the runtime tuning knobs shared by every executor:
//! command and config-await timeouts, the cycle drain bound, the worker poll
//! interval, buffer pool sizing, the consumer queue policy and logging.
//!
//! # File format
//!
//! The configuration is stored as TOML. Every field is optional; missing
//! fields take their defaults.
//!
//! ```toml
//! command_timeout_ms = 5000
//! drain_timeout_ms = 1000
//! buffer_pool_size = 3
//! consumer_queue = { leaky = 4 }
//! log_filter = "info,mediagraph=debug"
//! ```

use crate::error::{Error, Result};
use crate::runtime::QueuePolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default timeout for top-level network commands in milliseconds
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5_000;

/// Default time a node waits for a non-cyclic upstream config
pub const DEFAULT_CONFIG_TIMEOUT_MS: u64 = 2_000;

/// Default bound on draining an in-cycle link during teardown
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 1_000;

/// Default worker poll interval
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// Default number of buffers primed per output (triple buffering)
pub const DEFAULT_BUFFER_POOL_SIZE: usize = 3;

/// Default tracing filter
pub const DEFAULT_LOG_FILTER: &str = "info,mediagraph=debug";

/// Runtime configuration for the graph engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeout applied to top-level commands such as an effect swap
    pub command_timeout_ms: u64,

    /// How long a node waits for a non-cyclic upstream config
    pub config_timeout_ms: u64,

    /// How long teardown drains an in-cycle link waiting for end-of-stream
    pub drain_timeout_ms: u64,

    /// Poll interval of node worker threads
    pub poll_interval_ms: u64,

    /// Buffers primed into each output connection
    pub buffer_pool_size: usize,

    /// `tracing` filter directive used when `RUST_LOG` is unset
    pub log_filter: String,

    /// Directory for rolling log files, if file logging is wanted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,

    /// Queue policy for consumer queues
    pub consumer_queue: QueuePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            config_timeout_ms: DEFAULT_CONFIG_TIMEOUT_MS,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            buffer_pool_size: DEFAULT_BUFFER_POOL_SIZE,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            log_dir: None,
            consumer_queue: QueuePolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read engine config {:?}: {}", path, e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Load a configuration file, returning defaults on any error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load engine config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the configuration as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize engine config: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            Error::Config(format!("Failed to write engine config {:?}: {}", path, e))
        })
    }

    /// Reject values that would stall the runtime
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be positive".to_string()));
        }
        if self.buffer_pool_size == 0 {
            return Err(Error::Config("buffer_pool_size must be positive".to_string()));
        }
        if let QueuePolicy::Leaky(0) = self.consumer_queue {
            return Err(Error::Config("a leaky consumer queue needs room for one frame".to_string()));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn config_timeout(&self) -> Duration {
        Duration::from_millis(self.config_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.command_timeout(), Duration::from_secs(5));
        assert_eq!(config.buffer_pool_size, 3);
        assert_eq!(config.consumer_queue, QueuePolicy::Unbounded);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            drain_timeout_ms = 250
            consumer_queue = { leaky = 4 }
            "#,
        )
        .unwrap();
        assert_eq!(config.drain_timeout(), Duration::from_millis(250));
        assert_eq!(config.consumer_queue, QueuePolicy::Leaky(4));
        assert_eq!(config.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(EngineConfig::from_toml_str("poll_interval_ms = 0").is_err());
        assert!(EngineConfig::from_toml_str("consumer_queue = { leaky = 0 }").is_err());
        assert!(EngineConfig::from_toml_str("buffer_pool_size = \"three\"").is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.toml");

        let config = EngineConfig {
            buffer_pool_size: 2,
            log_dir: Some(dir.path().join("logs")),
            ..EngineConfig::default()
        };
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_or_default_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load_or_default(dir.path().join("missing.toml"));
        assert_eq!(config, EngineConfig::default());
    }
}
