//! Client configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config.

use crate::error::{Result, TransferError};
use crate::pipeline::PipelineOptions;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default pipeline buffer size (4MB)
pub const DEFAULT_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Default number of attempts per logical exchange
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Attempts per exchange, including the first one
    pub max_attempts: u32,
    /// Retries caused purely by connection teardown; these do not consume attempts
    pub max_connection_resets: u32,
    /// Fixed delay after a "slow down" signal
    pub slow_down_cooldown_ms: u64,
    /// Lower bound of the randomized backoff
    pub backoff_min_ms: u64,
    /// Upper bound of the randomized backoff is `attempt * backoff_step_ms`
    pub backoff_step_ms: u64,
    /// Chunk size read from upload sources and archive rotation buffer size
    pub buffer_size: usize,
    /// Cap on a single decompression output allocation
    pub max_output_buffer: usize,
    /// Cap on a single file write while extracting archives
    pub max_write_chunk: usize,
    /// zstd compression level
    pub compression_level: i32,
    /// Idle codec contexts kept per pool
    pub pool_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_connection_resets: 10,
            slow_down_cooldown_ms: 5_000,
            backoff_min_ms: 300,
            backoff_step_ms: 3_000,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_output_buffer: DEFAULT_BUFFER_SIZE,
            max_write_chunk: DEFAULT_BUFFER_SIZE,
            compression_level: 3,
            pool_capacity: 4,
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| TransferError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(TransferError::Config("max_attempts must be at least 1".into()));
        }
        if self.buffer_size == 0 || self.max_output_buffer == 0 || self.max_write_chunk == 0 {
            return Err(TransferError::Config("buffer sizes must be non-zero".into()));
        }
        if self.pool_capacity == 0 {
            return Err(TransferError::Config(
                "pool_capacity must be at least 1".into(),
            ));
        }
        if self.backoff_min_ms > self.backoff_step_ms {
            return Err(TransferError::Config(format!(
                "backoff_min_ms ({}) exceeds backoff_step_ms ({})",
                self.backoff_min_ms, self.backoff_step_ms
            )));
        }
        let levels = zstd::compression_level_range();
        if !levels.contains(&self.compression_level) {
            return Err(TransferError::Config(format!(
                "compression_level {} outside {:?}",
                self.compression_level, levels
            )));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            max_connection_resets: self.max_connection_resets,
            slow_down_cooldown: Duration::from_millis(self.slow_down_cooldown_ms),
            backoff_min: Duration::from_millis(self.backoff_min_ms),
            backoff_step: Duration::from_millis(self.backoff_step_ms),
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            buffer_size: self.buffer_size,
            max_output_buffer: self.max_output_buffer,
            max_write_chunk: self.max_write_chunk,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config = ClientConfig::from_toml_str("").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.buffer_size, 4 * 1024 * 1024);
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config = ClientConfig::from_toml_str(
            r#"
            max_attempts = 4
            slow_down_cooldown_ms = 10
            compression_level = 9
            "#,
        )
        .unwrap();
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.retry_policy().slow_down_cooldown, Duration::from_millis(10));
        assert_eq!(config.compression_level, 9);
        assert_eq!(config.backoff_min_ms, 300);
    }

    #[test]
    fn test_rejects_unknown_field() {
        assert!(ClientConfig::from_toml_str("retries = 3").is_err());
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let err = ClientConfig::from_toml_str("max_attempts = 0").unwrap_err();
        assert!(matches!(err, TransferError::Config(_)));
    }

    #[test]
    fn test_rejects_zero_pool_capacity() {
        let err = ClientConfig::from_toml_str("pool_capacity = 0").unwrap_err();
        assert!(matches!(err, TransferError::Config(_)));
        let config = ClientConfig {
            pool_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let config = ClientConfig {
            backoff_min_ms: 5_000,
            backoff_step_ms: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("client.toml");
        std::fs::write(&path, "buffer_size = 1024\n").unwrap();
        let config = ClientConfig::load(&path).unwrap();
        assert_eq!(config.pipeline_options().buffer_size, 1024);
    }
}
