//! Single-Flight Coalescing
//!
//! Per-key registry of in-flight operations. The first caller for a key
//! starts the operation; callers arriving while it runs attach to the same
//! shared result instead of starting their own. The entry is removed once
//! the operation completes, so the next caller after that starts fresh.
//!
//! The registry lock is only held while looking up or inserting an entry,
//! never across an await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

type Flight<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

/// Coalesces concurrent operations that share a key.
pub struct SingleFlight<T, E>
where
    T: Clone,
    E: Clone,
{
    flights: Mutex<HashMap<String, (u64, Flight<T, E>)>>,
    next_id: AtomicU64,
}

impl<T, E> SingleFlight<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Await the operation for `key`, starting it with `start` if none is
    /// running. Every caller attached to the same flight observes the same
    /// result.
    ///
    /// # Errors
    ///
    /// Returns the shared operation's error.
    pub async fn run<F>(&self, key: &str, start: F) -> Result<T, E>
    where
        F: FnOnce() -> BoxFuture<'static, Result<T, E>>,
    {
        let (id, flight) = self.join_or_start(key, start);
        let result = flight.await;
        self.finish(key, id);
        result
    }

    /// Whether an operation for `key` is currently registered.
    #[must_use]
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.flights
            .lock()
            .get(key)
            .is_some_and(|(_, flight)| flight.peek().is_none())
    }

    fn join_or_start<F>(&self, key: &str, start: F) -> (u64, Flight<T, E>)
    where
        F: FnOnce() -> BoxFuture<'static, Result<T, E>>,
    {
        let mut flights = self.flights.lock();

        if let Some((id, flight)) = flights.get(key) {
            // A finished flight whose waiters all went away is stale.
            if flight.peek().is_none() {
                tracing::debug!(key, "Joining in-flight operation");
                return (*id, flight.clone());
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let flight = start().shared();
        flights.insert(key.to_string(), (id, flight.clone()));
        (id, flight)
    }

    fn finish(&self, key: &str, id: u64) {
        let mut flights = self.flights.lock();
        if flights.get(key).is_some_and(|(current, _)| *current == id) {
            flights.remove(key);
        }
    }
}

impl<T, E> Default for SingleFlight<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone, E: Clone> std::fmt::Debug for SingleFlight<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.flights.lock().len())
            .finish()
    }
}
