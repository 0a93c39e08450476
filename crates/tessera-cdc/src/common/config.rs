//! Configuration for incremental snapshots
//!
//! ```rust
//! use tessera_cdc::common::{IncrementalSnapshotConfig, StartupMode};
//! use std::time::Duration;
//!
//! let config = IncrementalSnapshotConfig::builder()
//!     .chunk_size(4096)
//!     .max_concurrent_chunks(4)
//!     .window_timeout(Duration::from_secs(30))
//!     .startup_mode(StartupMode::Initial)
//!     .build();
//!
//! assert!(config.validate().is_ok());
//! ```

use crate::common::{CdcError, Result, RetryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where a job starts reading from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupMode {
    /// Snapshot every captured table, then stream the change log
    #[default]
    Initial,
    /// Skip the snapshot and stream from the current log position
    LatestOffset,
}

/// Incremental snapshot configuration.
#[derive(Debug, Clone)]
pub struct IncrementalSnapshotConfig {
    /// Target rows per chunk (default: 8096)
    pub chunk_size: usize,
    /// Lowest key distribution factor still split evenly
    pub even_distribution_factor_lower: f64,
    /// Highest key distribution factor still split evenly
    pub even_distribution_factor_upper: f64,
    /// Tables above `threshold * chunk_size` rows are split from samples
    pub sample_sharding_threshold: u64,
    /// Sample every N-th key when splitting from samples
    pub inverse_sampling_rate: u64,
    /// Maximum chunks snapshotted in parallel
    pub max_concurrent_chunks: usize,
    /// Capacity of the change log read-ahead buffer
    pub log_buffer_capacity: usize,
    /// How long a chunk waits for the log to reach its high watermark
    pub window_timeout: Duration,
    /// Snapshot-then-stream or stream only
    pub startup_mode: StartupMode,
    /// Retry policy for failed chunks
    pub chunk_retry: RetryConfig,
    /// Retry policy for reopening the change log
    pub log_retry: RetryConfig,
    /// Persist the assigner state after every finished chunk
    pub checkpoint_on_chunk_finish: bool,
    /// Streamed events between streaming checkpoints (0 = only on stop)
    pub streaming_checkpoint_interval: u64,
}

impl Default for IncrementalSnapshotConfig {
    fn default() -> Self {
        Self {
            chunk_size: 8096,
            even_distribution_factor_lower: 0.05,
            even_distribution_factor_upper: 1000.0,
            sample_sharding_threshold: 1000,
            inverse_sampling_rate: 1000,
            max_concurrent_chunks: 4,
            log_buffer_capacity: 1024,
            window_timeout: Duration::from_secs(60),
            startup_mode: StartupMode::Initial,
            chunk_retry: RetryConfig::default(),
            log_retry: RetryConfig::default(),
            checkpoint_on_chunk_finish: true,
            streaming_checkpoint_interval: 1000,
        }
    }
}

impl IncrementalSnapshotConfig {
    /// Create a builder for configuration.
    pub fn builder() -> IncrementalSnapshotConfigBuilder {
        IncrementalSnapshotConfigBuilder::default()
    }

    /// Check that the configuration is internally consistent.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(CdcError::config("chunk_size must be greater than 0"));
        }
        if self.even_distribution_factor_lower.is_nan()
            || self.even_distribution_factor_lower <= 0.0
            || !self.even_distribution_factor_upper.is_finite()
        {
            return Err(CdcError::config(
                "even distribution factors must be positive and finite",
            ));
        }
        if self.even_distribution_factor_lower > self.even_distribution_factor_upper {
            return Err(CdcError::config(format!(
                "even_distribution_factor_lower ({}) exceeds even_distribution_factor_upper ({})",
                self.even_distribution_factor_lower, self.even_distribution_factor_upper
            )));
        }
        if self.inverse_sampling_rate == 0 {
            return Err(CdcError::config(
                "inverse_sampling_rate must be greater than 0",
            ));
        }
        if self.max_concurrent_chunks == 0 {
            return Err(CdcError::config(
                "max_concurrent_chunks must be greater than 0",
            ));
        }
        if self.log_buffer_capacity == 0 {
            return Err(CdcError::config(
                "log_buffer_capacity must be greater than 0",
            ));
        }
        if self.window_timeout.is_zero() {
            return Err(CdcError::config("window_timeout must be non-zero"));
        }
        self.chunk_retry.validate("chunk_retry")?;
        self.log_retry.validate("log_retry")?;
        Ok(())
    }
}

/// Builder for IncrementalSnapshotConfig.
#[derive(Default)]
pub struct IncrementalSnapshotConfigBuilder {
    config: IncrementalSnapshotConfig,
}

impl IncrementalSnapshotConfigBuilder {
    /// Set chunk size (rows per chunk).
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Set the even distribution factor bounds.
    pub fn even_distribution_factor(mut self, lower: f64, upper: f64) -> Self {
        self.config.even_distribution_factor_lower = lower;
        self.config.even_distribution_factor_upper = upper;
        self
    }

    /// Set the sample sharding threshold.
    pub fn sample_sharding_threshold(mut self, threshold: u64) -> Self {
        self.config.sample_sharding_threshold = threshold;
        self
    }

    /// Set the inverse sampling rate.
    pub fn inverse_sampling_rate(mut self, rate: u64) -> Self {
        self.config.inverse_sampling_rate = rate;
        self
    }

    /// Set maximum concurrent chunks.
    pub fn max_concurrent_chunks(mut self, count: usize) -> Self {
        self.config.max_concurrent_chunks = count;
        self
    }

    /// Set the change log buffer capacity.
    pub fn log_buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.log_buffer_capacity = capacity;
        self
    }

    /// Set the merge window timeout.
    pub fn window_timeout(mut self, timeout: Duration) -> Self {
        self.config.window_timeout = timeout;
        self
    }

    /// Set the startup mode.
    pub fn startup_mode(mut self, mode: StartupMode) -> Self {
        self.config.startup_mode = mode;
        self
    }

    /// Set the chunk retry policy.
    pub fn chunk_retry(mut self, retry: RetryConfig) -> Self {
        self.config.chunk_retry = retry;
        self
    }

    /// Set the change log retry policy.
    pub fn log_retry(mut self, retry: RetryConfig) -> Self {
        self.config.log_retry = retry;
        self
    }

    /// Enable or disable checkpoints after every finished chunk.
    pub fn checkpoint_on_chunk_finish(mut self, enabled: bool) -> Self {
        self.config.checkpoint_on_chunk_finish = enabled;
        self
    }

    /// Checkpoint the streaming position every `events` emitted events.
    pub fn streaming_checkpoint_interval(mut self, events: u64) -> Self {
        self.config.streaming_checkpoint_interval = events;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> IncrementalSnapshotConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = IncrementalSnapshotConfig::default();
        assert_eq!(config.chunk_size, 8096);
        assert_eq!(config.startup_mode, StartupMode::Initial);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = IncrementalSnapshotConfig::builder()
            .chunk_size(10)
            .even_distribution_factor(0.5, 2.0)
            .max_concurrent_chunks(2)
            .startup_mode(StartupMode::LatestOffset)
            .checkpoint_on_chunk_finish(false)
            .streaming_checkpoint_interval(0)
            .build();

        assert_eq!(config.chunk_size, 10);
        assert_eq!(config.even_distribution_factor_lower, 0.5);
        assert_eq!(config.even_distribution_factor_upper, 2.0);
        assert_eq!(config.max_concurrent_chunks, 2);
        assert_eq!(config.startup_mode, StartupMode::LatestOffset);
        assert!(!config.checkpoint_on_chunk_finish);
        assert_eq!(config.streaming_checkpoint_interval, 0);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero_chunk = IncrementalSnapshotConfig::builder().chunk_size(0).build();
        assert!(matches!(zero_chunk.validate(), Err(CdcError::Config(_))));

        let inverted = IncrementalSnapshotConfig::builder()
            .even_distribution_factor(10.0, 1.0)
            .build();
        assert!(inverted.validate().is_err());

        let no_workers = IncrementalSnapshotConfig::builder()
            .max_concurrent_chunks(0)
            .build();
        assert!(no_workers.validate().is_err());

        let no_timeout = IncrementalSnapshotConfig::builder()
            .window_timeout(Duration::ZERO)
            .build();
        assert!(no_timeout.validate().is_err());
    }

    #[test]
    fn test_startup_mode_serde() {
        let json = serde_json::to_string(&StartupMode::LatestOffset).unwrap();
        assert_eq!(json, "\"latest_offset\"");
    }
}
