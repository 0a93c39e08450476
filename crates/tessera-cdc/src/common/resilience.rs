//! Retry primitives for snapshot and log operations
//!
//! - Retry configuration with exponential backoff and jitter
//! - An async retry loop that only retries errors a predicate accepts

use crate::common::{CdcError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

// ============================================================================
// Retry Configuration
// ============================================================================

/// Configuration for retry behavior.
///
/// # Example
///
/// ```rust
/// use tessera_cdc::common::RetryConfig;
/// use std::time::Duration;
///
/// let config = RetryConfig::builder()
///     .max_retries(5)
///     .retry_delay(Duration::from_millis(200))
///     .max_delay(Duration::from_secs(10))
///     .jitter(0.25)
///     .build();
///
/// assert_eq!(config.max_retries(), 5);
/// assert!(config.should_retry(4));
/// assert!(!config.should_retry(5));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum retry attempts.
    /// - `-1` = infinite retries (use with caution)
    /// - `0` = retries disabled
    /// - `n` = retry up to n times
    max_retries: i32,
    /// Base delay between retries (before exponential backoff).
    retry_delay: Duration,
    /// Maximum delay cap.
    max_delay: Duration,
    /// Jitter factor (0.0 - 1.0).
    jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    /// Create a builder for RetryConfig.
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::default()
    }

    /// Create a disabled retry config (no retries).
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Create an infinite retry config.
    pub fn infinite() -> Self {
        Self {
            max_retries: -1,
            ..Default::default()
        }
    }

    /// Get maximum retries (-1 = infinite, 0 = disabled).
    pub fn max_retries(&self) -> i32 {
        self.max_retries
    }

    /// Get base retry delay.
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Get maximum delay cap.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Get jitter factor.
    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Check if we should retry given the number of attempts already retried.
    pub fn should_retry(&self, attempt: u32) -> bool {
        match self.max_retries {
            -1 => true,
            0 => false,
            n if n < 0 => false,
            n => attempt < n as u32,
        }
    }

    /// Calculate delay for a given attempt (exponential backoff with jitter).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self
            .retry_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        let capped = base.min(self.max_delay);

        if self.jitter > 0.0 {
            let jitter_range = capped.as_secs_f64() * self.jitter;
            // Deterministic golden-ratio jitter keeps delays reproducible
            let jitter_offset = (attempt as f64 * 0.618033988749895) % 1.0;
            let jitter_amount = jitter_range * (jitter_offset * 2.0 - 1.0);
            let adjusted = capped.as_secs_f64() + jitter_amount;
            Duration::from_secs_f64(adjusted.max(0.0))
        } else {
            capped
        }
    }

    pub(crate) fn validate(&self, name: &str) -> Result<()> {
        if self.max_retries < -1 {
            return Err(CdcError::config(format!(
                "{name}.max_retries must be >= -1, got {}",
                self.max_retries
            )));
        }
        if self.retry_delay > self.max_delay {
            return Err(CdcError::config(format!(
                "{name}.retry_delay must not exceed {name}.max_delay"
            )));
        }
        Ok(())
    }
}

/// Builder for RetryConfig.
#[derive(Debug, Clone, Default)]
pub struct RetryConfigBuilder {
    max_retries: Option<i32>,
    retry_delay: Option<Duration>,
    max_delay: Option<Duration>,
    jitter: Option<f64>,
}

impl RetryConfigBuilder {
    /// Set maximum retry attempts.
    pub fn max_retries(mut self, value: i32) -> Self {
        self.max_retries = Some(value);
        self
    }

    /// Set base retry delay.
    pub fn retry_delay(mut self, value: Duration) -> Self {
        self.retry_delay = Some(value);
        self
    }

    /// Set maximum delay cap.
    pub fn max_delay(mut self, value: Duration) -> Self {
        self.max_delay = Some(value);
        self
    }

    /// Set jitter factor (0.0 - 1.0).
    pub fn jitter(mut self, value: f64) -> Self {
        self.jitter = Some(value.clamp(0.0, 1.0));
        self
    }

    /// Build the RetryConfig.
    pub fn build(self) -> RetryConfig {
        let defaults = RetryConfig::default();
        RetryConfig {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            retry_delay: self.retry_delay.unwrap_or(defaults.retry_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            jitter: self.jitter.unwrap_or(defaults.jitter),
        }
    }
}

// ============================================================================
// Retry loop
// ============================================================================

/// Run `op` until it succeeds, fails with an error `retriable` rejects, or
/// the retry budget is exhausted.
///
/// The last error is returned unchanged when giving up.
pub async fn retry_with_backoff<T, F, Fut, P>(
    config: &RetryConfig,
    operation: &str,
    retriable: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&CdcError) -> bool,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if retriable(&e) && config.should_retry(attempt) => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after transient error"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_retries: i32) -> RetryConfig {
        RetryConfig::builder()
            .max_retries(max_retries)
            .retry_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(5))
            .jitter(0.0)
            .build()
    }

    #[test]
    fn test_retry_config_builder() {
        let config = RetryConfig::builder()
            .max_retries(5)
            .retry_delay(Duration::from_millis(500))
            .max_delay(Duration::from_secs(30))
            .jitter(0.1)
            .build();

        assert_eq!(config.max_retries(), 5);
        assert_eq!(config.retry_delay(), Duration::from_millis(500));
        assert_eq!(config.max_delay(), Duration::from_secs(30));
        assert!((config.jitter() - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_retry_config_should_retry() {
        let config = RetryConfig::builder().max_retries(3).build();
        assert!(config.should_retry(0));
        assert!(config.should_retry(2));
        assert!(!config.should_retry(3));

        assert!(!RetryConfig::disabled().should_retry(0));
        assert!(RetryConfig::infinite().should_retry(1000));
    }

    #[test]
    fn test_retry_config_delay_calculation() {
        let config = RetryConfig::builder()
            .retry_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(10))
            .jitter(0.0)
            .build();

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
        // Capped
        assert_eq!(config.delay_for_attempt(20), Duration::from_secs(10));
    }

    #[test]
    fn test_retry_config_validate() {
        assert!(RetryConfig::default().validate("retry").is_ok());
        assert!(RetryConfig::builder()
            .max_retries(-2)
            .build()
            .validate("retry")
            .is_err());
        assert!(RetryConfig::builder()
            .retry_delay(Duration::from_secs(5))
            .max_delay(Duration::from_secs(1))
            .build()
            .validate("retry")
            .is_err());
    }

    #[tokio::test]
    async fn test_retry_with_backoff_recovers() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = retry_with_backoff(&fast(3), "test", CdcError::is_retriable, || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CdcError::connection_lost("reset"))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_with_backoff_gives_up() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = retry_with_backoff(&fast(2), "test", CdcError::is_retriable, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(CdcError::source_unavailable("down"))
            }
        })
        .await;

        assert!(matches!(result, Err(CdcError::SourceUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_with_backoff_skips_fatal() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = retry_with_backoff(&fast(5), "test", CdcError::is_retriable, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(CdcError::log_position_not_available("0/1"))
            }
        })
        .await;

        assert!(matches!(result, Err(CdcError::LogPositionNotAvailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
