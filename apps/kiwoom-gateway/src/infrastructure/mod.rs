//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Configuration loaded from the environment.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Kiwoom REST adapters: auth, API client, pagination.
pub mod kiwoom;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Key-value store adapters (Redis and in-memory).
pub mod store;

/// WebSocket price streaming.
pub mod streaming;

/// OpenTelemetry tracing integration.
pub mod telemetry;
