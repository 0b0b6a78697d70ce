//! Kiwoom Gateway Binary
//!
//! Starts the token lifecycle, the price stream and the ingestion pipeline.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin kiwoom-gateway
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `KIWOOM_APP_KEY`: Kiwoom app key
//! - `KIWOOM_SECRET_KEY`: Kiwoom secret key
//!
//! ## Optional
//! - `KIWOOM_BASE_URL`: REST base URL (default: <https://api.kiwoom.com>)
//! - `KIWOOM_WS_URL`: Price stream URL
//! - `KIWOOM_STREAM_STOCKS`: Comma separated stock codes (default: 005930)
//! - `KIWOOM_RATE_LIMIT_PER_SEC`: Shared request rate (default: 1.5)
//! - `REDIS_URL`: Redis URL (default: in-memory store)
//! - `GATEWAY_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`, `LOG_FORMAT`
//! - `RUST_LOG`: Log filter (default: kiwoom_gateway=info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use kiwoom_gateway::application::ports::{SharedAuthEndpoint, SharedClock, SystemClock};
use kiwoom_gateway::application::services::{IngestionPipeline, TokenManager, TokenManagerConfig};
use kiwoom_gateway::infrastructure::config::GatewayConfig;
use kiwoom_gateway::infrastructure::health::{HealthServer, HealthServerState};
use kiwoom_gateway::infrastructure::kiwoom::{
    EndpointRegistry, KiwoomAuthClient, KiwoomClient, KiwoomClientConfig,
};
use kiwoom_gateway::infrastructure::streaming::StreamSupervisor;
use kiwoom_gateway::infrastructure::{store, telemetry};
use kiwoom_gateway::{RateLimiter, RetryPolicy, init_metrics};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Kiwoom Gateway");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder unavailable, metrics disabled");
    }

    let config = GatewayConfig::from_env().context("loading configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();
    let clock: SharedClock = Arc::new(SystemClock);

    let store = store::connect(config.redis_url.as_deref())
        .await
        .context("connecting to store")?;

    let limiter = RateLimiter::shared(config.kiwoom.rate_limit_per_sec)
        .context("building rate limiter")?;

    let auth_endpoint: SharedAuthEndpoint = Arc::new(
        KiwoomAuthClient::new(
            &config.kiwoom.auth_url,
            config.credentials.clone(),
            config.kiwoom.http_timeout,
            Arc::clone(&clock),
        )
        .context("building auth client")?,
    );

    let tokens = TokenManager::new(
        auth_endpoint,
        Arc::clone(&store),
        Arc::clone(&clock),
        Arc::clone(&limiter),
        TokenManagerConfig {
            margin: config.kiwoom.refresh_margin(),
            ..TokenManagerConfig::default()
        },
        shutdown_token.clone(),
    );

    let client = KiwoomClient::new(
        KiwoomClientConfig {
            base_url: config.kiwoom.base_url.clone(),
            timeout: config.kiwoom.http_timeout,
            retry: RetryPolicy::conservative(),
            pagination: config.kiwoom.pagination_limits(),
        },
        config.credentials.clone(),
        EndpointRegistry::default(),
        tokens.clone(),
        Arc::clone(&limiter),
    )
    .context("building API client")?;

    match client.tokens().get_valid_token(&shutdown_token).await {
        Ok(token) => tracing::info!(expires_at = %token.expires_at(), "Access token ready"),
        Err(e) => tracing::warn!(error = %e, "Token warm-up failed, will retry on first call"),
    }

    let pipeline = IngestionPipeline::new(Arc::clone(&store), config.ingestion.pipeline_config());
    let supervisor = StreamSupervisor::new(
        config.stream.streaming_config(),
        config.stream.reconnect_config(),
        Arc::clone(&clock),
    );

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        tokens,
        supervisor.state(),
        pipeline.stats(),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );

    let (tick_tx, tick_rx) = mpsc::channel(config.stream.channel_capacity);
    let mut tasks = JoinSet::new();

    let pipeline_cancel = shutdown_token.clone();
    tasks.spawn(async move {
        pipeline.run(tick_rx, pipeline_cancel).await;
    });

    let stream_cancel = shutdown_token.clone();
    let stream_shutdown = shutdown_token.clone();
    tasks.spawn(async move {
        if let Err(e) = supervisor.run(tick_tx, stream_cancel).await {
            tracing::error!(error = %e, "Price stream stopped");
            stream_shutdown.cancel();
        }
    });

    tasks.spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!("Kiwoom Gateway ready");

    await_shutdown(shutdown_token).await;

    let drain = async {
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Task panicked during shutdown");
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Shutdown timed out, aborting remaining tasks"
        );
        tasks.abort_all();
    }

    tracing::info!("Kiwoom Gateway stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &GatewayConfig) {
    tracing::info!(
        base_url = %config.kiwoom.base_url,
        rate_limit_per_sec = config.kiwoom.rate_limit_per_sec,
        stocks = config.stream.stocks.len(),
        store = if config.redis_url.is_some() { "redis" } else { "memory" },
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        auth_url = %config.kiwoom.auth_url,
        ws_url = %config.stream.ws_url,
        "Kiwoom endpoints"
    );
}

/// Wait for SIGTERM, SIGINT, or an internal cancellation.
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
        () = shutdown_token.cancelled() => {
            tracing::info!("Internal shutdown requested");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
