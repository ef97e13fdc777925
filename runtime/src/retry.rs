//! Fixed-delay retry for transient failures.
//!
//! Publishing retries a bounded number of times with the same pause between
//! attempts. There is no backoff growth and no jitter, and no pause follows the
//! final attempt.
//!
//! # Example
//!
//! ```rust
//! use inventory_events_runtime::retry::{RetryPolicy, retry_fixed};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(3)
//!     .delay(Duration::from_millis(10))
//!     .build();
//!
//! let result = retry_fixed(&policy, |_attempt| async { Ok::<_, String>(42) }).await;
//!
//! assert_eq!(result.ok(), Some(42));
//! # }
//! ```

use crate::metrics::RetryMetrics;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Retry policy with a fixed pause between attempts.
///
/// # Default Values
///
/// - `max_attempts`: 3
/// - `delay`: 2 seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first
    pub max_attempts: usize,
    /// Pause between consecutive attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: None,
            delay: None,
        }
    }

    /// Attempts actually made; a zero budget still runs the operation once.
    #[must_use]
    pub const fn effective_attempts(&self) -> usize {
        if self.max_attempts == 0 { 1 } else { self.max_attempts }
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<usize>,
    delay: Option<Duration>,
}

impl RetryPolicyBuilder {
    /// Set the total number of attempts.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the pause between attempts.
    #[must_use]
    pub const fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            delay: self.delay.unwrap_or(defaults.delay),
        }
    }
}

/// All attempts failed.
#[derive(Error, Debug)]
#[error("Operation failed after {attempts} attempts: {last_error}")]
pub struct RetryExhausted<E: std::fmt::Display> {
    /// Number of attempts made
    pub attempts: usize,
    /// Error from the final attempt
    pub last_error: E,
}

/// Run `operation` until it succeeds or the policy's attempts are used up.
///
/// The operation receives the 1-based attempt number. Callers log individual
/// failures themselves, since only they know which failures deserve a warning
/// and which an error.
///
/// # Errors
///
/// Returns [`RetryExhausted`] carrying the last attempt's error.
pub async fn retry_fixed<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> Result<T, RetryExhausted<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.effective_attempts();
    let mut attempt = 1;

    loop {
        RetryMetrics::record_attempt();

        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                    RetryMetrics::record_success();
                }
                return Ok(result);
            }
            Err(err) => {
                if attempt >= max_attempts {
                    RetryMetrics::record_exhausted();
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: err,
                    });
                }

                tracing::debug!(
                    attempt,
                    max_attempts,
                    delay_ms = policy.delay.as_millis(),
                    "Retrying after delay"
                );
                sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}
