//! Streaming Session
//!
//! One WebSocket connection to the price feed. The session subscribes on
//! connect, then forwards decoded ticks into a bounded channel until the
//! connection ends or it is cancelled. Reconnection belongs to the
//! supervisor.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::StreamError;
use super::codec::decode_frame;
use crate::application::ports::SharedClock;
use crate::domain::market::PriceTick;
use crate::infrastructure::metrics::{self, FrameKind};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection settings for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingConfig {
    /// WebSocket URL.
    pub url: String,
    /// Stock codes to subscribe to.
    pub stocks: Vec<String>,
    /// Bound on the TCP + TLS + WebSocket handshake.
    pub connect_timeout: Duration,
}

impl StreamingConfig {
    /// Settings with the default connect timeout.
    #[must_use]
    pub const fn new(url: String, stocks: Vec<String>) -> Self {
        Self {
            url,
            stocks,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Serialize)]
struct SubscribeDirective<'a> {
    action: &'static str,
    stocks: &'a [String],
}

/// A live, subscribed WebSocket connection.
pub struct StreamingSession {
    id: Uuid,
    ws: WsStream,
    clock: SharedClock,
    ticks: u64,
}

impl StreamingSession {
    /// Connect and send the subscribe directive.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Connect` if the handshake fails or times out
    /// and `StreamError::SubscribeFailed` if the directive cannot be sent.
    pub async fn connect(config: &StreamingConfig, clock: SharedClock) -> Result<Self, StreamError> {
        let (mut ws, _response) =
            tokio::time::timeout(config.connect_timeout, tokio_tungstenite::connect_async(config.url.as_str()))
                .await
                .map_err(|_| StreamError::Connect(format!("timed out after {:?}", config.connect_timeout)))?
                .map_err(|e| StreamError::Connect(e.to_string()))?;

        let directive = SubscribeDirective {
            action: "subscribe",
            stocks: &config.stocks,
        };
        let json = serde_json::to_string(&directive)
            .map_err(|e| StreamError::SubscribeFailed(e.to_string()))?;
        ws.send(Message::Text(json.into()))
            .await
            .map_err(|e| StreamError::SubscribeFailed(e.to_string()))?;

        let id = Uuid::new_v4();
        tracing::info!(
            session_id = %id,
            url = %config.url,
            stocks = config.stocks.len(),
            "Price stream connected and subscribed"
        );

        Ok(Self {
            id,
            ws,
            clock,
            ticks: 0,
        })
    }

    /// Session identifier used in logs.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Ticks forwarded so far.
    #[must_use]
    pub const fn ticks_forwarded(&self) -> u64 {
        self.ticks
    }

    /// Receive frames and forward ticks to `sink` until the session ends.
    ///
    /// Undecodable frames are logged and dropped. A full `sink` applies
    /// backpressure to the socket read.
    ///
    /// # Errors
    ///
    /// Always ends with an error:
    /// - `ConnectionClosed` on a close frame or end of stream
    /// - `WebSocket` on a transport error
    /// - `Cancelled` when `cancel` fires or the receiving side is dropped
    pub async fn run(
        &mut self,
        sink: &mpsc::Sender<PriceTick>,
        cancel: &CancellationToken,
    ) -> Result<(), StreamError> {
        loop {
            let message = tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    tracing::info!(session_id = %self.id, "Price stream cancelled");
                    if let Err(e) = self.ws.close(None).await {
                        tracing::debug!(error = %e, "Close handshake failed");
                    }
                    return Err(StreamError::Cancelled);
                }

                message = self.ws.next() => message,
            };

            match message {
                Some(Ok(Message::Text(text))) => {
                    self.forward(text.as_str(), sink, cancel).await?;
                }
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => self.forward(text, sink, cancel).await?,
                    Err(e) => {
                        metrics::record_stream_frame(FrameKind::Invalid);
                        tracing::warn!(session_id = %self.id, error = %e, "Dropping non-UTF-8 frame");
                    }
                },
                Some(Ok(Message::Ping(_))) => {
                    // The Pong is already queued by tungstenite; push it out now.
                    self.ws.flush().await?;
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(session_id = %self.id, frame = ?frame, "Server closed price stream");
                    return Err(StreamError::ConnectionClosed);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Err(StreamError::ConnectionClosed),
            }
        }
    }

    async fn forward(
        &mut self,
        text: &str,
        sink: &mpsc::Sender<PriceTick>,
        cancel: &CancellationToken,
    ) -> Result<(), StreamError> {
        let frame = match decode_frame(text, self.clock.now_millis()) {
            Ok(frame) => frame,
            Err(e) => {
                metrics::record_stream_frame(FrameKind::Invalid);
                tracing::warn!(session_id = %self.id, error = %e, "Dropping undecodable frame");
                return Ok(());
            }
        };

        if frame.control > 0 {
            metrics::record_stream_frame(FrameKind::Control);
            tracing::debug!(session_id = %self.id, control = frame.control, "Skipped control message");
        }
        for rejected in &frame.rejected {
            metrics::record_stream_frame(FrameKind::Invalid);
            tracing::warn!(session_id = %self.id, error = %rejected, "Dropping invalid price entry");
        }

        if !frame.ticks.is_empty() {
            metrics::record_stream_frame(FrameKind::Price);
        }
        for tick in frame.ticks {
            tokio::select! {
                biased;

                () = cancel.cancelled() => return Err(StreamError::Cancelled),

                sent = sink.send(tick) => {
                    if sent.is_err() {
                        tracing::info!(session_id = %self.id, "Tick receiver dropped, ending session");
                        return Err(StreamError::Cancelled);
                    }
                    self.ticks += 1;
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for StreamingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingSession")
            .field("id", &self.id)
            .field("ticks", &self.ticks)
            .finish_non_exhaustive()
    }
}
