//! Stream Supervisor
//!
//! Keeps a price stream alive: connects a session, runs it until it ends,
//! then reconnects with backoff. Failures reset once a session has
//! forwarded at least one tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::StreamError;
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::session::{StreamingConfig, StreamingSession};
use crate::application::ports::SharedClock;
use crate::domain::market::PriceTick;
use crate::infrastructure::metrics;

/// Live stream state, shared with the health endpoint.
#[derive(Debug, Default)]
pub struct StreamState {
    connected: AtomicBool,
    sessions: AtomicU64,
    ticks: AtomicU64,
    reconnects: AtomicU64,
}

impl StreamState {
    /// Whether a session is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> StreamStateSnapshot {
        StreamStateSnapshot {
            connected: self.is_connected(),
            sessions: self.sessions.load(Ordering::Relaxed),
            ticks_forwarded: self.ticks.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
        metrics::set_stream_connected(connected);
    }
}

/// Serializable view of `StreamState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamStateSnapshot {
    /// Whether a session is connected.
    pub connected: bool,
    /// Sessions established since start.
    pub sessions: u64,
    /// Ticks forwarded across all sessions.
    pub ticks_forwarded: u64,
    /// Reconnection attempts since start.
    pub reconnects: u64,
}

/// Owns the reconnect loop for one price stream.
pub struct StreamSupervisor {
    config: StreamingConfig,
    reconnect: ReconnectConfig,
    clock: SharedClock,
    state: Arc<StreamState>,
}

impl StreamSupervisor {
    /// Create a supervisor.
    #[must_use]
    pub fn new(config: StreamingConfig, reconnect: ReconnectConfig, clock: SharedClock) -> Self {
        Self {
            config,
            reconnect,
            clock,
            state: Arc::new(StreamState::default()),
        }
    }

    /// Shared state handle.
    #[must_use]
    pub fn state(&self) -> Arc<StreamState> {
        Arc::clone(&self.state)
    }

    /// Run sessions until cancelled or out of reconnect attempts.
    ///
    /// # Errors
    ///
    /// Returns the last session error once the reconnect policy gives up.
    pub async fn run(
        self,
        sink: mpsc::Sender<PriceTick>,
        cancel: CancellationToken,
    ) -> Result<(), StreamError> {
        let mut policy = ReconnectPolicy::new(self.reconnect);

        loop {
            let error = match StreamingSession::connect(&self.config, Arc::clone(&self.clock)).await {
                Ok(mut session) => {
                    self.state.sessions.fetch_add(1, Ordering::Relaxed);
                    self.state.set_connected(true);

                    let result = session.run(&sink, &cancel).await;

                    self.state.set_connected(false);
                    self.state
                        .ticks
                        .fetch_add(session.ticks_forwarded(), Ordering::Relaxed);
                    if session.ticks_forwarded() > 0 {
                        policy.reset();
                    }

                    match result {
                        Err(StreamError::Cancelled) => return Ok(()),
                        Err(e) => {
                            tracing::warn!(
                                session_id = %session.id(),
                                ticks = session.ticks_forwarded(),
                                error = %e,
                                "Price stream session ended"
                            );
                            e
                        }
                        Ok(()) => StreamError::ConnectionClosed,
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, url = %self.config.url, "Price stream connect failed");
                    e
                }
            };

            if cancel.is_cancelled() {
                return Ok(());
            }

            let Some(delay) = policy.next_delay() else {
                tracing::error!(
                    attempts = policy.attempt_count(),
                    error = %error,
                    "Price stream reconnect attempts exhausted"
                );
                return Err(error);
            };

            self.state.reconnects.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                attempt = policy.attempt_count(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting price stream"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl std::fmt::Debug for StreamSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSupervisor")
            .field("config", &self.config)
            .field("reconnect", &self.reconnect)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
