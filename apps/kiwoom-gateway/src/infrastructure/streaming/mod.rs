//! Real-time Price Streaming
//!
//! WebSocket ingestion of price pushes:
//!
//! - `codec`: Frame decoding into `PriceTick`s
//! - `session`: One subscribed connection
//! - `reconnect`: Backoff between sessions
//! - `supervisor`: Reconnect loop and shared stream state

mod codec;
mod reconnect;
mod session;
mod supervisor;

pub use codec::{CodecError, DecodedFrame, decode_frame};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use session::{StreamingConfig, StreamingSession};
pub use supervisor::{StreamState, StreamStateSnapshot, StreamSupervisor};

use thiserror::Error;

/// Streaming errors.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Connection could not be established.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Subscribe directive could not be sent.
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Transport error on an established connection.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Server closed the connection or the stream ended.
    #[error("connection closed")]
    ConnectionClosed,

    /// Session was cancelled.
    #[error("cancelled")]
    Cancelled,
}
