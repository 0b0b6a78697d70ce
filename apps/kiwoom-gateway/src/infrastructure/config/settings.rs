//! Gateway Configuration Settings
//!
//! Configuration types for the gateway, loaded from environment variables.
//! Malformed optional values fall back to their defaults; values that parse
//! but make no sense (a zero rate, an empty stock list) are rejected.

use std::time::Duration;

use crate::application::services::IngestionConfig;
use crate::domain::auth::RefreshMargin;
use crate::infrastructure::kiwoom::PaginationLimits;
use crate::infrastructure::streaming::{ReconnectConfig, StreamingConfig};

/// Default REST and auth base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.kiwoom.com";

/// Default real-time WebSocket URL.
pub const DEFAULT_WS_URL: &str = "wss://api.kiwoom.com:10000/api/dostk/websocket";

/// Kiwoom API credentials.
#[derive(Clone)]
pub struct Credentials {
    app_key: String,
    secret_key: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(app_key: String, secret_key: String) -> Self {
        Self {
            app_key,
            secret_key,
        }
    }

    /// Get the app key.
    #[must_use]
    pub fn app_key(&self) -> &str {
        &self.app_key
    }

    /// Get the secret key.
    #[must_use]
    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("app_key", &"[REDACTED]")
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// Brokerage API settings.
#[derive(Debug, Clone)]
pub struct KiwoomSettings {
    /// REST base URL.
    pub base_url: String,
    /// OAuth base URL.
    pub auth_url: String,
    /// HTTP request timeout.
    pub http_timeout: Duration,
    /// Shared request rate in permits per second.
    pub rate_limit_per_sec: f64,
    /// Fixed proactive refresh window.
    pub token_refresh_margin: Duration,
    /// Fraction of token lifetime used as refresh window (0 disables).
    pub token_refresh_fraction: f64,
    /// Maximum pages per paginated call.
    pub pagination_max_pages: u32,
    /// Maximum duration of one paginated call.
    pub pagination_max_duration: Duration,
}

impl Default for KiwoomSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            auth_url: DEFAULT_BASE_URL.to_string(),
            http_timeout: Duration::from_secs(30),
            rate_limit_per_sec: 1.5,
            token_refresh_margin: Duration::from_secs(300),
            token_refresh_fraction: 0.0,
            pagination_max_pages: 1000,
            pagination_max_duration: Duration::from_secs(30 * 60),
        }
    }
}

impl KiwoomSettings {
    /// Refresh margin for the token manager.
    #[must_use]
    pub fn refresh_margin(&self) -> RefreshMargin {
        RefreshMargin::fixed(self.token_refresh_margin)
            .with_lifetime_fraction(self.token_refresh_fraction)
    }

    /// Limits for paginated calls.
    #[must_use]
    pub const fn pagination_limits(&self) -> PaginationLimits {
        PaginationLimits {
            max_pages: self.pagination_max_pages,
            max_duration: self.pagination_max_duration,
        }
    }
}

/// Price stream settings.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// WebSocket URL.
    pub ws_url: String,
    /// Stock codes to subscribe to.
    pub stocks: Vec<String>,
    /// Capacity of the tick channel between session and pipeline.
    pub channel_capacity: usize,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            stocks: vec!["005930".to_string()],
            channel_capacity: 4096,
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 0,
        }
    }
}

impl StreamSettings {
    /// Backoff settings for the stream supervisor.
    #[must_use]
    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: self.reconnect_delay_initial,
            max_delay: self.reconnect_delay_max,
            multiplier: self.reconnect_delay_multiplier,
            max_attempts: self.max_reconnect_attempts,
            ..ReconnectConfig::default()
        }
    }

    /// Session settings for the stream supervisor.
    #[must_use]
    pub fn streaming_config(&self) -> StreamingConfig {
        StreamingConfig::new(self.ws_url.clone(), self.stocks.clone())
    }
}

/// Ingestion pipeline settings.
#[derive(Debug, Clone)]
pub struct IngestionSettings {
    /// Maximum ticks processed at once.
    pub concurrency: usize,
    /// TTL of the real-time price cache.
    pub cache_ttl: Duration,
    /// Batch aggregation hash key.
    pub batch_key: String,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        let defaults = IngestionConfig::default();
        Self {
            concurrency: defaults.concurrency,
            cache_ttl: defaults.cache_ttl,
            batch_key: defaults.batch_key,
        }
    }
}

impl IngestionSettings {
    /// Pipeline configuration.
    #[must_use]
    pub fn pipeline_config(&self) -> IngestionConfig {
        IngestionConfig {
            cache_ttl: self.cache_ttl,
            batch_key: self.batch_key.clone(),
            concurrency: self.concurrency,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check and metrics HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// API credentials.
    pub credentials: Credentials,
    /// Brokerage API settings.
    pub kiwoom: KiwoomSettings,
    /// Price stream settings.
    pub stream: StreamSettings,
    /// Ingestion settings.
    pub ingestion: IngestionSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Redis URL; `None` selects the in-memory store.
    pub redis_url: Option<String>,
}

impl GatewayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or a
    /// value is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Same as [`GatewayConfig::from_env`].
    pub fn from_lookup(env: Lookup<'_>) -> Result<Self, ConfigError> {
        let app_key = required(env, "KIWOOM_APP_KEY")?;
        let secret_key = required(env, "KIWOOM_SECRET_KEY")?;

        let kiwoom_defaults = KiwoomSettings::default();
        let base_url = env("KIWOOM_BASE_URL")
            .filter(|v| !v.trim().is_empty())
            .map_or(kiwoom_defaults.base_url, |v| trim_url(&v));
        let auth_url = env("KIWOOM_AUTH_URL")
            .filter(|v| !v.trim().is_empty())
            .map_or_else(|| base_url.clone(), |v| trim_url(&v));

        let kiwoom = KiwoomSettings {
            base_url,
            auth_url,
            http_timeout: parse_env_duration_secs(
                env,
                "KIWOOM_HTTP_TIMEOUT_SECS",
                kiwoom_defaults.http_timeout,
            ),
            rate_limit_per_sec: parse_env_f64(
                env,
                "KIWOOM_RATE_LIMIT_PER_SEC",
                kiwoom_defaults.rate_limit_per_sec,
            ),
            token_refresh_margin: parse_env_duration_secs(
                env,
                "KIWOOM_TOKEN_REFRESH_MARGIN_SECS",
                kiwoom_defaults.token_refresh_margin,
            ),
            token_refresh_fraction: parse_env_f64(
                env,
                "KIWOOM_TOKEN_REFRESH_FRACTION",
                kiwoom_defaults.token_refresh_fraction,
            ),
            pagination_max_pages: parse_env_u32(
                env,
                "KIWOOM_PAGINATION_MAX_PAGES",
                kiwoom_defaults.pagination_max_pages,
            ),
            pagination_max_duration: parse_env_duration_secs(
                env,
                "KIWOOM_PAGINATION_MAX_DURATION_SECS",
                kiwoom_defaults.pagination_max_duration,
            ),
        };

        if !kiwoom.rate_limit_per_sec.is_finite() || kiwoom.rate_limit_per_sec <= 0.0 {
            return Err(ConfigError::Invalid {
                key: "KIWOOM_RATE_LIMIT_PER_SEC".to_string(),
                message: format!("must be positive, got {}", kiwoom.rate_limit_per_sec),
            });
        }
        if !(0.0..=1.0).contains(&kiwoom.token_refresh_fraction) {
            return Err(ConfigError::Invalid {
                key: "KIWOOM_TOKEN_REFRESH_FRACTION".to_string(),
                message: format!("must be within 0..=1, got {}", kiwoom.token_refresh_fraction),
            });
        }

        let stream_defaults = StreamSettings::default();
        let stocks = env("KIWOOM_STREAM_STOCKS").map_or(stream_defaults.stocks, |v| {
            v.split(',')
                .map(str::trim)
                .filter(|code| !code.is_empty())
                .map(str::to_string)
                .collect()
        });
        if stocks.is_empty() {
            return Err(ConfigError::Invalid {
                key: "KIWOOM_STREAM_STOCKS".to_string(),
                message: "at least one stock code is required".to_string(),
            });
        }

        let stream = StreamSettings {
            ws_url: env("KIWOOM_WS_URL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(stream_defaults.ws_url),
            stocks,
            channel_capacity: parse_env_usize(
                env,
                "STREAM_CHANNEL_CAPACITY",
                stream_defaults.channel_capacity,
            )
            .max(1),
            reconnect_delay_initial: parse_env_duration_millis(
                env,
                "STREAM_RECONNECT_DELAY_INITIAL_MS",
                stream_defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_env_duration_secs(
                env,
                "STREAM_RECONNECT_DELAY_MAX_SECS",
                stream_defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_env_f64(
                env,
                "STREAM_RECONNECT_DELAY_MULTIPLIER",
                stream_defaults.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: parse_env_u32(
                env,
                "STREAM_MAX_RECONNECT_ATTEMPTS",
                stream_defaults.max_reconnect_attempts,
            ),
        };

        let ingestion_defaults = IngestionSettings::default();
        let ingestion = IngestionSettings {
            concurrency: parse_env_usize(
                env,
                "INGESTION_CONCURRENCY",
                ingestion_defaults.concurrency,
            ),
            cache_ttl: parse_env_duration_secs(
                env,
                "INGESTION_CACHE_TTL_SECS",
                ingestion_defaults.cache_ttl,
            ),
            batch_key: env("INGESTION_BATCH_KEY")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(ingestion_defaults.batch_key),
        };
        if ingestion.concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "INGESTION_CONCURRENCY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let server = ServerSettings {
            health_port: parse_env_u16(
                env,
                "GATEWAY_HEALTH_PORT",
                ServerSettings::default().health_port,
            ),
        };

        let redis_url = env("REDIS_URL").filter(|v| !v.trim().is_empty());

        Ok(Self {
            credentials: Credentials::new(app_key, secret_key),
            kiwoom,
            stream,
            ingestion,
            server,
            redis_url,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has an unusable value.
    #[error("invalid value for {key}: {message}")]
    Invalid {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        message: String,
    },
}

/// Variable source used while loading configuration.
pub type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn required(env: Lookup<'_>, key: &str) -> Result<String, ConfigError> {
    let value = env(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
    if value.trim().is_empty() {
        return Err(ConfigError::EmptyValue(key.to_string()));
    }
    Ok(value)
}

fn trim_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn parse_env_u16(env: Lookup<'_>, key: &str, default: u16) -> u16 {
    env(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn parse_env_u32(env: Lookup<'_>, key: &str, default: u32) -> u32 {
    env(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn parse_env_usize(env: Lookup<'_>, key: &str, default: usize) -> usize {
    env(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn parse_env_f64(env: Lookup<'_>, key: &str, default: f64) -> f64 {
    env(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn parse_env_duration_secs(env: Lookup<'_>, key: &str, default: Duration) -> Duration {
    env(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(env: Lookup<'_>, key: &str, default: Duration) -> Duration {
    env(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
