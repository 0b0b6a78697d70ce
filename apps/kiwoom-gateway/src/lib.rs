#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Kiwoom Gateway - Brokerage API Integration Core
//!
//! Shared plumbing for talking to the Kiwoom REST and WebSocket APIs: one
//! process-wide rate limit, a single-flight access token lifecycle, a
//! retrying API client with continuation-key pagination, and a supervised
//! price stream that fans ticks out to a key-value store.
//!
//! # Layers (inside -> outside)
//!
//! - **Domain**: Pure value types
//!   - `auth`: Access tokens, refresh margins, token status
//!   - `market`: Price ticks and published events
//!   - `pagination`: Continuation cursors
//!
//! - **Resilience**: Rate limiter and retry executor
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Auth endpoint, key-value store, clock
//!   - `services`: Token manager, ingestion pipeline, single flight
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `kiwoom`: OAuth client, API client, endpoint registry, pagination
//!   - `streaming`: WebSocket session and supervisor
//!   - `store`: Redis and in-memory stores
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//!                     +--------------+
//! API callers ------->| KiwoomClient |--> rate limiter --> Kiwoom REST
//!                     +--------------+         ^
//!                            |                 |
//!                            v                 |
//!                     +--------------+         |
//!                     | TokenManager |---------+--> /oauth2/token
//!                     +--------------+
//!
//! Kiwoom WS --> StreamSupervisor --> mpsc --> IngestionPipeline --> cache / pub-sub / batch
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Pure types with no I/O.
pub mod domain;

/// Rate limiting and retry.
pub mod resilience;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::auth::{RefreshMargin, Token, TokenError, TokenStatus};
pub use domain::market::{PriceEvent, PriceTick, TickError};
pub use domain::pagination::{ContYn, ContinuationCursor};

// Resilience
pub use resilience::{RateLimiter, RetryError, RetryExecutor, RetryPolicy, SharedRateLimiter};

// Ports and services
pub use application::ports::{
    AuthEndpoint, AuthError, Clock, KeyValueStore, SharedStore, StoreError, SystemClock,
};
pub use application::services::{
    IngestionConfig, IngestionPipeline, PipelineStatsSnapshot, StageReport, TokenManager,
    TokenManagerConfig,
};

// Kiwoom adapters
pub use infrastructure::kiwoom::{
    ApiError, ApiRequest, EndpointRegistry, KiwoomAuthClient, KiwoomClient, KiwoomClientConfig,
    Paginator, RawResponse,
};

// Streaming
pub use infrastructure::streaming::{StreamError, StreamSupervisor, StreamingSession};

// Infrastructure config
pub use infrastructure::config::{ConfigError, Credentials, GatewayConfig};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
