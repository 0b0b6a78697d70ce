//! Domain Layer - Core brokerage integration types.
//!
//! Pure value types with no I/O: access tokens, price ticks and
//! pagination cursors.

/// Access tokens, refresh margins and derived token status.
pub mod auth;

/// Real-time price ticks and published price events.
pub mod market;

/// Continuation cursors for paged endpoints.
pub mod pagination;
