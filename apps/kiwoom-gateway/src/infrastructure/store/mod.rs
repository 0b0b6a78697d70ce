//! Store Adapters
//!
//! Implementations of the `KeyValueStore` port.

mod memory;
mod redis_store;

pub use memory::{InMemoryStore, StoreOp};
pub use redis_store::RedisStore;

use std::sync::Arc;

use crate::application::ports::{SharedStore, StoreError};

/// Connect to Redis when a URL is given, otherwise use an in-memory store.
///
/// # Errors
///
/// Returns `StoreError::Connection` if Redis cannot be reached.
pub async fn connect(redis_url: Option<&str>) -> Result<SharedStore, StoreError> {
    match redis_url {
        Some(url) => Ok(Arc::new(RedisStore::connect(url).await?)),
        None => {
            tracing::warn!("REDIS_URL not set, using in-memory store");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}
