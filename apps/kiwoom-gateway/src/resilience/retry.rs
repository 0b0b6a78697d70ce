//! Bounded Retry With Exponential Backoff
//!
//! Runs an async operation up to `max_attempts` times. After a retryable
//! failure on attempt `k` the executor sleeps `min(max, initial * multiplier^(k-1))`
//! before the next attempt. Classification is supplied by the caller so the
//! executor stays independent of any particular error type.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

// =============================================================================
// Policy
// =============================================================================

/// Retry budget and backoff curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    name: &'static str,
    max_attempts: u32,
    initial_backoff: Duration,
    multiplier: f64,
    max_backoff: Duration,
}

impl RetryPolicy {
    /// Create a policy. A `max_attempts` of zero is treated as one.
    #[must_use]
    pub const fn new(
        name: &'static str,
        max_attempts: u32,
        initial_backoff: Duration,
        multiplier: f64,
        max_backoff: Duration,
    ) -> Self {
        Self {
            name,
            max_attempts,
            initial_backoff,
            multiplier,
            max_backoff,
        }
    }

    /// Aggressive policy for latency sensitive calls: 3 attempts, 1s doubling to 10s.
    #[must_use]
    pub const fn fast() -> Self {
        Self::new(
            "fast",
            3,
            Duration::from_secs(1),
            2.0,
            Duration::from_secs(10),
        )
    }

    /// Patient policy for bulk calls: 5 attempts, 2s doubling to 30s.
    #[must_use]
    pub const fn conservative() -> Self {
        Self::new(
            "conservative",
            5,
            Duration::from_secs(2),
            2.0,
            Duration::from_secs(30),
        )
    }

    /// Look up a named policy.
    #[must_use]
    pub fn by_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "fast" => Some(Self::fast()),
            "conservative" => Some(Self::conservative()),
            _ => None,
        }
    }

    /// Policy name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Total attempts including the first.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        if self.max_attempts == 0 {
            1
        } else {
            self.max_attempts
        }
    }

    /// Delay before the first retry.
    #[must_use]
    pub const fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    /// Backoff growth factor.
    #[must_use]
    pub const fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Backoff ceiling.
    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);

        if !scaled.is_finite() || scaled >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(scaled.max(0.0))
    }
}

// =============================================================================
// Classification and Errors
// =============================================================================

/// Whether a failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Transient; try again after backoff.
    Retry,
    /// Permanent; surface immediately.
    Fatal,
}

/// Terminal outcome of a retried operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RetryError<E> {
    /// The last failure, either fatal or the one that exhausted the budget.
    #[error("failed after {attempts} attempt(s): {error}")]
    Failed {
        /// Attempts made.
        attempts: u32,
        /// Last error observed.
        error: E,
    },

    /// Cancellation fired; no further attempts were scheduled.
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled {
        /// Attempts started before cancellation.
        attempts: u32,
    },
}

impl<E> RetryError<E> {
    /// Attempts made before giving up.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Failed { attempts, .. } | Self::Cancelled { attempts } => *attempts,
        }
    }
}

// =============================================================================
// Executor
// =============================================================================

/// Runs operations under a [`RetryPolicy`].
#[derive(Debug, Clone, Copy)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create an executor for a policy.
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The policy in use.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails fatally, exhausts the budget
    /// or `cancel` fires. The operation receives the 1-based attempt number.
    ///
    /// # Errors
    ///
    /// Returns `RetryError::Failed` with the last error, or
    /// `RetryError::Cancelled` when cancelled during an attempt or a backoff.
    pub async fn run<T, E, Op, Fut, C>(
        &self,
        cancel: &CancellationToken,
        classify: C,
        mut operation: Op,
    ) -> Result<T, RetryError<E>>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> RetryDecision,
        E: Display,
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            attempt += 1;

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts: attempt });
                }
                outcome = operation(attempt) => outcome,
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if classify(&error) == RetryDecision::Fatal {
                return Err(RetryError::Failed {
                    attempts: attempt,
                    error,
                });
            }

            if attempt >= max_attempts {
                tracing::warn!(
                    policy = self.policy.name(),
                    attempts = attempt,
                    error = %error,
                    "Retry budget exhausted"
                );
                return Err(RetryError::Failed {
                    attempts: attempt,
                    error,
                });
            }

            let delay = self.policy.backoff_for(attempt);
            tracing::warn!(
                policy = self.policy.name(),
                attempt,
                max_attempts,
                delay_ms = delay.as_millis(),
                error = %error,
                "Retryable failure, backing off"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts: attempt });
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
