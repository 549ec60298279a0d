//! Bounded retry with fixed or exponential backoff.
//!
//! [`with_retry`] is agnostic to what a failure means: every `Err` from the
//! operation is retried until the policy is exhausted, and the last error is
//! handed back untouched. Callers pick which steps go through it.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Governs how often and how patiently a step is re-invoked.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Always >= 1.
    pub max_attempts: u32,
    /// Wait before the second attempt.
    pub initial_delay: Duration,
    /// 1.0 keeps the delay fixed, anything larger grows it exponentially.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(5000),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            backoff_multiplier: backoff_multiplier.max(1.0),
        }
    }

    /// Wait before attempt `attempt` (1-based): nothing before the first,
    /// `initial_delay * multiplier^(attempt - 2)` afterwards.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if secs.is_finite() {
            Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
        } else {
            Duration::MAX
        }
    }
}

/// Runs `operation` until it succeeds or `policy.max_attempts` is reached.
///
/// `step` only labels the warning logged between attempts. On exhaustion the
/// error of the final attempt is returned as-is.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, step: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= max_attempts => return Err(err),
            Err(err) => {
                let delay = policy.delay_before(attempt + 1);
                warn!(
                    step,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Attempt {} failed. Retrying in {}ms...",
                    attempt,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
