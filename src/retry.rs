//! Retry with exponential backoff for the external lookup
//!
//! Upstream identity APIs are slow and rate limited. Every call through
//! [`retry_with_backoff`] is bounded by `max_retries`, so a lookup can fail
//! but never hang forever.

use crate::config::RetrySettings;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Backoff policy for retried operations
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,

    pub initial_backoff: Duration,

    /// Upper bound for any single wait, including server-requested ones
    pub max_backoff: Duration,

    pub multiplier: f64,

    /// Stretch each wait by up to 25% so concurrent callers spread out
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            multiplier: settings.multiplier,
            jitter: settings.jitter,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Short waits, for tests and local mocks
    pub fn quick() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(200),
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Wait before retry number `attempt` (zero based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let base = (self.initial_backoff.as_secs_f64() * exp).min(self.max_backoff.as_secs_f64());

        let secs = if self.jitter {
            base * (1.0 + jitter_fraction() * 0.25)
        } else {
            base
        };

        Duration::from_secs_f64(secs)
    }
}

/// 0.0..1.0 taken from the clock's sub-second nanos
fn jitter_fraction() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    f64::from(nanos % 1000) / 1000.0
}

/// How an error should be treated by the retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    /// Server told us when to come back (e.g. a rate-limit reset header)
    RetryAfter(Duration),
    /// Permanent failure
    NoRetry,
}

/// Errors that know whether retrying can help
pub trait RetryableError {
    fn retry_decision(&self) -> RetryDecision;
}

/// Run `operation` until it succeeds, fails permanently, or runs out of retries.
///
/// `operation_name` only appears in log output.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let wait = match err.retry_decision() {
            RetryDecision::NoRetry => {
                debug!(
                    operation = operation_name,
                    attempt, "Giving up on non-retryable error: {}", err
                );
                return Err(err);
            }
            _ if attempt >= policy.max_retries => {
                warn!(
                    operation = operation_name,
                    attempts = attempt + 1,
                    "Retries exhausted: {}",
                    err
                );
                return Err(err);
            }
            RetryDecision::RetryAfter(requested) => requested.min(policy.max_backoff),
            RetryDecision::Retry => policy.backoff_for(attempt),
        };

        warn!(
            operation = operation_name,
            attempt = attempt + 1,
            max_attempts = policy.max_retries + 1,
            backoff_ms = wait.as_millis() as u64,
            "Retrying after error: {}",
            err
        );

        sleep(wait).await;
        attempt += 1;
    }
}
