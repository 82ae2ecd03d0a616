//! Backoff and timeout helpers.
//!
//! Sync replay is the main user: a failed replay waits, then tries again,
//! with the wait growing geometrically up to a ceiling.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Backoff policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total runs including the first (1 = never retry).
    pub max_attempts: u32,
    /// Wait before the second run.
    pub initial_delay: Duration,
    /// Ceiling for any single wait.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Stretch each wait by up to a quarter so retries from many clients
    /// do not line up.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Run once, never retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Wait before run number `attempt` (1-indexed). The first run never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(retry) = attempt.checked_sub(2) else {
            return Duration::ZERO;
        };

        let ceiling = self.max_delay.as_secs_f64();
        let grown = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(retry as i32);
        let delay = if grown.is_finite() { grown.min(ceiling) } else { ceiling };

        let spread = if self.jitter { 1.0 + jitter_fraction() * 0.25 } else { 1.0 };
        Duration::from_secs_f64(delay * spread)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Pseudo-random fraction in `0.0..=1.0` from the clock's sub-second nanos.
fn jitter_fraction() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos) / f64::from(u32::MAX)
}

/// Run `operation` until it succeeds or the attempts run out, returning the
/// last error.
///
/// It always runs at least once, even if `max_attempts` is zero.
pub async fn retry_with_backoff<T, E, F, Fut>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(config, operation, |_| true).await
}

/// Like [`retry_with_backoff`], but gives up at once on errors for which
/// `should_retry` is false.
pub async fn retry_if<T, E, F, Fut, P>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.attempts();
    let mut attempt = 1;

    loop {
        let error = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if attempt >= max_attempts {
            warn!(attempt, max_attempts, error = %error, "Giving up");
            return Err(error);
        }
        if !should_retry(&error) {
            warn!(attempt, error = %error, "Not retrying permanent failure");
            return Err(error);
        }

        attempt += 1;
        let delay = config.delay_for_attempt(attempt);
        warn!(attempt, ?delay, error = %error, "Attempt failed, backing off");
        sleep(delay).await;
    }
}

/// Bound `operation` by `timeout`.
pub async fn with_timeout<T, F, Fut>(timeout: Duration, operation: F) -> Result<T, crate::C3Error>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation())
        .await
        .map_err(|_| crate::C3Error::Timeout(timeout))
}
