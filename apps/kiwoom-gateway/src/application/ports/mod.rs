//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `AuthEndpoint`: Issues new access tokens
//! - `KeyValueStore`: Cache, pub/sub and hash store (also the token store)
//! - `Clock`: Wall-clock time

mod auth_port;
mod clock_port;
mod store_port;

#[cfg(test)]
pub use auth_port::MockAuthEndpoint;
pub use auth_port::{AuthEndpoint, AuthError, SharedAuthEndpoint};
pub use clock_port::{Clock, ManualClock, SharedClock, SystemClock};
pub use store_port::{KeyValueStore, SharedStore, StoreError};
