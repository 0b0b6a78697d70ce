//! Streaming and Ingestion Integration Tests
//!
//! Runs sessions and the supervisor against a local WebSocket server and
//! feeds their ticks through the ingestion pipeline.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use kiwoom_gateway::application::ports::{KeyValueStore, SharedClock, SystemClock};
use kiwoom_gateway::application::services::{IngestionConfig, IngestionPipeline};
use kiwoom_gateway::infrastructure::store::InMemoryStore;
use kiwoom_gateway::infrastructure::streaming::{
    ReconnectConfig, StreamError, StreamSupervisor, StreamingConfig, StreamingSession,
};

const PRICES: &str = r#"[{"stock_code":"005930","price":"+71200","timestamp":1733200000000},{"stock_code":"000660","price":182000,"timestamp":1733200000001}]"#;

// =============================================================================
// Local WebSocket Server
// =============================================================================

/// What the server saw from one client.
#[derive(Debug, Default)]
struct Observed {
    subscribe: Option<String>,
    pongs: Vec<Vec<u8>>,
}

/// Accept `connections` clients in turn. Each gets the subscribe read, then
/// `frames`, then a close unless `hold_open` is set.
async fn serve(
    connections: usize,
    frames: Vec<Message>,
    hold_open: bool,
) -> (String, mpsc::UnboundedReceiver<Observed>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (observed_tx, observed_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        for _ in 0..connections {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let mut observed = Observed::default();

            if let Some(Ok(Message::Text(text))) = ws.next().await {
                observed.subscribe = Some(text.to_string());
            }

            for frame in frames.clone() {
                let is_ping = matches!(frame, Message::Ping(_));
                ws.send(frame).await.unwrap();
                if is_ping && let Some(Ok(Message::Pong(data))) = ws.next().await {
                    observed.pongs.push(data.to_vec());
                }
            }

            if !hold_open {
                let _ = ws.close(None).await;
            }
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Pong(data) = message {
                    observed.pongs.push(data.to_vec());
                }
            }
            let _ = observed_tx.send(observed);
        }
    });

    (url, observed_rx)
}

fn text(body: &str) -> Message {
    Message::text(body.to_string())
}

fn clock() -> SharedClock {
    Arc::new(SystemClock)
}

fn config(url: &str) -> StreamingConfig {
    StreamingConfig {
        url: url.to_string(),
        stocks: vec!["005930".to_string(), "000660".to_string()],
        connect_timeout: Duration::from_secs(2),
    }
}

fn quick_reconnect(max_attempts: u32) -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(20),
        multiplier: 2.0,
        jitter_factor: 0.0,
        max_attempts,
    }
}

// =============================================================================
// Session
// =============================================================================

#[tokio::test]
async fn session_subscribes_and_forwards_valid_ticks() {
    let (url, mut observed) = serve(
        1,
        vec![
            text(r#"{"action":"subscribe","return_code":0,"return_msg":"ok"}"#),
            text("not json at all"),
            text(PRICES),
            Message::Binary(br#"{"stock_code":"035720","price":"-41250"}"#.to_vec().into()),
        ],
        false,
    )
    .await;

    let (tx, mut rx) = mpsc::channel(16);
    let mut session = StreamingSession::connect(&config(&url), clock()).await.unwrap();
    let result = timeout(Duration::from_secs(5), session.run(&tx, &CancellationToken::new()))
        .await
        .unwrap();

    assert!(matches!(result, Err(StreamError::ConnectionClosed)), "{result:?}");
    assert_eq!(session.ticks_forwarded(), 3);

    let first = rx.recv().await.unwrap();
    assert_eq!(first.stock_code(), "005930");
    assert_eq!(first.price(), Decimal::new(71_200, 0));
    assert_eq!(rx.recv().await.unwrap().stock_code(), "000660");
    let third = rx.recv().await.unwrap();
    assert_eq!(third.stock_code(), "035720");
    assert_eq!(third.price(), Decimal::new(41_250, 0));
    assert!(rx.try_recv().is_err());

    let seen = observed.recv().await.unwrap();
    assert_eq!(
        seen.subscribe.as_deref(),
        Some(r#"{"action":"subscribe","stocks":["005930","000660"]}"#)
    );
}

#[tokio::test]
async fn session_answers_ping_with_pong() {
    let (url, mut observed) = serve(1, vec![Message::Ping(b"hb".to_vec().into())], false).await;

    let (tx, _rx) = mpsc::channel(4);
    let mut session = StreamingSession::connect(&config(&url), clock()).await.unwrap();
    let _ = timeout(Duration::from_secs(5), session.run(&tx, &CancellationToken::new()))
        .await
        .unwrap();

    let seen = observed.recv().await.unwrap();
    assert_eq!(seen.pongs, vec![b"hb".to_vec()]);
}

#[tokio::test]
async fn session_stops_on_cancel() {
    let (url, _observed) = serve(1, vec![], true).await;

    let (tx, _rx) = mpsc::channel(4);
    let cancel = CancellationToken::new();
    let mut session = StreamingSession::connect(&config(&url), clock()).await.unwrap();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let result = timeout(Duration::from_secs(5), session.run(&tx, &cancel))
        .await
        .unwrap();
    assert!(matches!(result, Err(StreamError::Cancelled)), "{result:?}");
}

// =============================================================================
// Supervisor
// =============================================================================

#[tokio::test]
async fn supervisor_cancel_ends_live_session() {
    let (url, _observed) = serve(2, vec![text(PRICES)], true).await;

    let supervisor = StreamSupervisor::new(config(&url), quick_reconnect(0), clock());
    let state = supervisor.state();
    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(supervisor.run(tx, cancel.clone()));

    for _ in 0..2 {
        timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    }
    cancel.cancel();
    let result = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

    assert!(result.is_ok(), "{result:?}");
    assert!(!state.is_connected());
    assert_eq!(state.snapshot().sessions, 1);
}

#[tokio::test]
async fn supervisor_starts_a_new_session_when_the_first_ends() {
    let (url, mut observed) = serve(2, vec![text(PRICES)], false).await;

    let supervisor = StreamSupervisor::new(config(&url), quick_reconnect(0), clock());
    let state = supervisor.state();
    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(supervisor.run(tx, cancel.clone()));

    for _ in 0..4 {
        timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    }
    for _ in 0..2 {
        let seen = timeout(Duration::from_secs(5), observed.recv()).await.unwrap().unwrap();
        assert!(seen.subscribe.is_some());
    }
    cancel.cancel();
    timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let snapshot = state.snapshot();
    assert!(snapshot.sessions >= 2, "{snapshot:?}");
    assert!(snapshot.ticks_forwarded >= 4, "{snapshot:?}");
    assert!(snapshot.reconnects >= 1, "{snapshot:?}");
}

// =============================================================================
// End to End
// =============================================================================

#[tokio::test]
async fn streamed_ticks_reach_cache_channel_and_batch() {
    let (url, _observed) = serve(1, vec![text(PRICES)], false).await;

    let store = Arc::new(InMemoryStore::new());
    let mut updates = store.subscribe("stock:price:005930");
    let pipeline = IngestionPipeline::new(store.clone(), IngestionConfig::default());
    let stats = pipeline.stats();

    let supervisor = StreamSupervisor::new(config(&url), quick_reconnect(1), clock());
    let (tx, rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();

    let (stream_result, ()) = timeout(
        Duration::from_secs(10),
        async { tokio::join!(supervisor.run(tx, cancel.clone()), pipeline.run(rx, cancel.clone())) },
    )
    .await
    .unwrap();

    assert!(matches!(stream_result, Err(StreamError::Connect(_))), "{stream_result:?}");

    let cached = store.get("realtime:price:005930").await.unwrap().unwrap();
    assert!(cached.contains("71200"), "{cached}");
    assert_eq!(store.ttl_of("realtime:price:005930"), Some(Duration::from_secs(5)));
    assert!(store.exists("realtime:price:000660").await.unwrap());

    let event = updates.recv().await.unwrap();
    let event: serde_json::Value = serde_json::from_str(&event).unwrap();
    assert_eq!(event["stock_code"], "005930");
    assert_eq!(event["timestamp"], 1_733_200_000_000_i64);

    let batch = store.hash("batch:queue:price");
    assert!(batch.contains_key("005930:1733200000000"));
    assert!(batch.contains_key("000660:1733200000001"));

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.ticks_processed, 2);
    assert_eq!(snapshot.ticks_complete, 2);
}
