//! Key-Value / Pub-Sub Store Port (Driven Port)
//!
//! Contract for the cache and event bus. The same shape backs the token
//! store, the real-time price cache, price event publishing and the batch
//! aggregation hash.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// Store operation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Could not reach the store.
    #[error("store connection error: {0}")]
    Connection(String),

    /// The store rejected or failed a command.
    #[error("store command failed: {0}")]
    Command(String),

    /// Value could not be encoded or decoded.
    #[error("store serialization error: {0}")]
    Serialization(String),
}

/// Shared handle to a store implementation.
pub type SharedStore = Arc<dyn KeyValueStore>;

/// Key-value store with TTL, pub/sub and hashes.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Set `key` to `value`, expiring after `ttl` when given.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Get the value at `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Delete `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Whether `key` exists.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Publish `message` on `channel`. Returns the number of receivers.
    async fn publish(&self, channel: &str, message: &str) -> Result<u64, StoreError>;

    /// Set `field` in the hash at `key`.
    async fn h_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;
}
