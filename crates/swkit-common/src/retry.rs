//! Retry and timeout utilities.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::SwKitError;

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (1 = no retries).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Backoff multiplier (2.0 doubles each time).
    pub backoff_multiplier: f64,
    /// Add up to 25% jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Schedule used for background sync when the host has no scheduler of
    /// its own: few attempts, long gaps.
    pub fn background_sync() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5 * 60),
            backoff_multiplier: 3.0,
            jitter: true,
        }
    }

    /// Calculate delay for a given attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi((attempt - 2) as i32);
        let delay = Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()));

        if self.jitter {
            delay + Duration::from_secs_f64(delay.as_secs_f64() * rand_jitter() * 0.25)
        } else {
            delay
        }
    }
}

/// Cheap pseudo-random value in `0.0..=1.0` taken from the clock.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos as f64) / (u32::MAX as f64)
}

/// Retry a fallible async operation with exponential backoff.
///
/// Returns the last error once `max_attempts` is exhausted.
pub async fn retry_with_backoff<T, E, F, Fut>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(config, |_| true, operation).await
}

/// Like [`retry_with_backoff`], but stops at the first error for which
/// `should_retry` is false.
pub async fn retry_with_backoff_if<T, E, F, Fut, P>(
    config: &RetryConfig,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retries");
                }
                return Ok(value);
            }
            Err(e) if !should_retry(&e) => {
                warn!(attempt, error = %e, "Not retrying permanent failure");
                return Err(e);
            }
            Err(e) if attempt >= attempts => {
                warn!(attempt, max_attempts = attempts, error = %e, "Giving up");
                return Err(e);
            }
            Err(e) => {
                warn!(attempt, max_attempts = attempts, error = %e, "Operation failed");
            }
        }

        attempt += 1;
        let delay = config.delay_for_attempt(attempt);
        debug!(attempt, ?delay, "Retrying after delay");
        sleep(delay).await;
    }
}

/// Run an operation with a timeout.
pub async fn with_timeout<T, Fut>(timeout: Duration, operation: Fut) -> Result<T, SwKitError>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_| SwKitError::Timeout(timeout))
}
