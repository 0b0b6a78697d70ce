//! In-Memory Store
//!
//! Process-local `KeyValueStore` used when no Redis URL is configured and
//! as the fake in tests. Keys honor their TTL against the tokio clock, so
//! paused-time tests can expire them. Publishing goes through per-channel
//! broadcast senders; the receiver count mirrors Redis `PUBLISH` replies.
//!
//! Failures can be injected per operation to exercise error paths.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::application::ports::{KeyValueStore, StoreError};

const CHANNEL_CAPACITY: usize = 1024;

/// Store operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// `set`
    Set,
    /// `get`
    Get,
    /// `delete`
    Delete,
    /// `exists`
    Exists,
    /// `publish`
    Publish,
    /// `h_set`
    HSet,
}

#[derive(Debug)]
struct Entry {
    value: String,
    ttl: Option<Duration>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

#[derive(Debug, Default)]
struct State {
    values: HashMap<String, Entry>,
    hashes: HashMap<String, HashMap<String, String>>,
    channels: HashMap<String, broadcast::Sender<String>>,
    published: Vec<(String, String)>,
    failures: HashMap<StoreOp, u32>,
}

impl State {
    fn take_failure(&mut self, op: StoreOp) -> Result<(), StoreError> {
        match self.failures.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(StoreError::Command(format!("injected {op:?} failure")))
            }
            _ => Ok(()),
        }
    }

    fn live_entry(&mut self, key: &str) -> Option<&Entry> {
        let now = Instant::now();
        if self.values.get(key).is_some_and(|entry| !entry.is_live(now)) {
            self.values.remove(key);
        }
        self.values.get(key)
    }
}

/// In-process key-value, pub/sub and hash store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `op` fail with `StoreError::Command`.
    pub fn fail_next(&self, op: StoreOp, times: u32) {
        self.state.lock().failures.insert(op, times);
    }

    /// TTL a live key was written with.
    #[must_use]
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.state.lock().live_entry(key).and_then(|entry| entry.ttl)
    }

    /// Every message published so far, as `(channel, message)`.
    #[must_use]
    pub fn published(&self) -> Vec<(String, String)> {
        self.state.lock().published.clone()
    }

    /// Snapshot of the hash at `key`.
    #[must_use]
    pub fn hash(&self, key: &str) -> HashMap<String, String> {
        self.state.lock().hashes.get(key).cloned().unwrap_or_default()
    }

    /// Receive messages published on `channel` from now on.
    #[must_use]
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.state
            .lock()
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.take_failure(StoreOp::Set)?;
        state.values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                ttl,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut state = self.state.lock();
        state.take_failure(StoreOp::Get)?;
        Ok(state.live_entry(key).map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        state.take_failure(StoreOp::Delete)?;
        let existed = state.live_entry(key).is_some();
        state.values.remove(key);
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        state.take_failure(StoreOp::Exists)?;
        Ok(state.live_entry(key).is_some())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<u64, StoreError> {
        let mut state = self.state.lock();
        state.take_failure(StoreOp::Publish)?;
        state
            .published
            .push((channel.to_string(), message.to_string()));
        let receivers = state
            .channels
            .get(channel)
            .and_then(|sender| sender.send(message.to_string()).ok())
            .unwrap_or(0);
        Ok(u64::try_from(receivers).unwrap_or(u64::MAX))
    }

    async fn h_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.take_failure(StoreOp::HSet)?;
        state
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }
}
