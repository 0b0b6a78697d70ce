//! Configuration Module
//!
//! Configuration loading for the gateway service.

mod settings;

pub use settings::{
    ConfigError, Credentials, DEFAULT_BASE_URL, DEFAULT_WS_URL, GatewayConfig, IngestionSettings,
    KiwoomSettings, Lookup, ServerSettings, StreamSettings,
};
