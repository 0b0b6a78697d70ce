//! Resilience patterns for outbound brokerage calls.
//!
//! The shared rate limiter and the bounded retry executor. Both honor a
//! caller supplied `CancellationToken` at every wait.

mod rate_limiter;
mod retry;

pub use rate_limiter::{RateLimitError, RateLimitPermit, RateLimiter, SharedRateLimiter};
pub use retry::{RetryDecision, RetryError, RetryExecutor, RetryPolicy};
