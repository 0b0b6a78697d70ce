//! Shared Request Rate Limiter
//!
//! Token bucket gate in front of every outbound brokerage request. The
//! provider enforces an aggregate ceiling across all endpoints, so a single
//! instance is built at startup and handed to every caller as an `Arc`.
//!
//! Burst is fixed at one permit so requests stay evenly spaced instead of
//! bunching after an idle period. Waiting callers are never rejected; the
//! only way out of `acquire` without a permit is cancellation.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorLimiter};
use tokio_util::sync::CancellationToken;

use crate::infrastructure::metrics;

type DirectLimiter = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Shared handle to the process-wide limiter.
pub type SharedRateLimiter = Arc<RateLimiter>;

/// Rate limiter errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RateLimitError {
    /// Configured rate is not a positive finite number.
    #[error("invalid rate limit: {permits_per_second} permits/s")]
    InvalidRate {
        /// Rejected rate.
        permits_per_second: f64,
    },

    /// Cancellation fired while waiting for a permit.
    #[error("cancelled while waiting for a rate limit permit")]
    Cancelled,
}

/// Grant to issue one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPermit {
    waited: Duration,
}

impl RateLimitPermit {
    /// Time spent waiting for this permit.
    #[must_use]
    pub const fn waited(&self) -> Duration {
        self.waited
    }
}

/// Token bucket limiter with burst capacity of one.
pub struct RateLimiter {
    limiter: DirectLimiter,
    permits_per_second: f64,
    period: Duration,
}

impl RateLimiter {
    /// Default rate, kept below the provider's hard cap of 2/s.
    pub const DEFAULT_PERMITS_PER_SECOND: f64 = 1.5;

    /// Create a limiter replenishing `permits_per_second` permits.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitError::InvalidRate` if the rate is not positive and
    /// finite.
    pub fn new(permits_per_second: f64) -> Result<Self, RateLimitError> {
        let invalid = RateLimitError::InvalidRate { permits_per_second };
        if !permits_per_second.is_finite() || permits_per_second <= 0.0 {
            return Err(invalid);
        }

        let period = Duration::from_secs_f64(1.0 / permits_per_second);
        let quota = Quota::with_period(period)
            .ok_or(invalid)?
            .allow_burst(NonZeroU32::MIN);

        Ok(Self {
            limiter: GovernorLimiter::direct(quota),
            permits_per_second,
            period,
        })
    }

    /// Create a limiter wrapped for sharing.
    ///
    /// # Errors
    ///
    /// See [`RateLimiter::new`].
    pub fn shared(permits_per_second: f64) -> Result<SharedRateLimiter, RateLimitError> {
        Self::new(permits_per_second).map(Arc::new)
    }

    /// Wait for a permit.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitError::Cancelled` if `cancel` fires first. No permit
    /// is consumed in that case.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RateLimitPermit, RateLimitError> {
        let started = Instant::now();

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(RateLimitError::Cancelled),
            () = self.limiter.until_ready() => {
                let waited = started.elapsed();
                metrics::record_rate_limit_wait(waited);
                if waited > self.period {
                    tracing::debug!(waited_ms = waited.as_millis(), "Rate limit permit delayed");
                }
                Ok(RateLimitPermit { waited })
            }
        }
    }

    /// Take a permit only if one is available right now.
    #[must_use]
    pub fn try_acquire(&self) -> Option<RateLimitPermit> {
        self.limiter.check().ok().map(|()| RateLimitPermit {
            waited: Duration::ZERO,
        })
    }

    /// Configured rate.
    #[must_use]
    pub const fn permits_per_second(&self) -> f64 {
        self.permits_per_second
    }

    /// Minimum spacing between permits.
    #[must_use]
    pub const fn period(&self) -> Duration {
        self.period
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("permits_per_second", &self.permits_per_second)
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}
