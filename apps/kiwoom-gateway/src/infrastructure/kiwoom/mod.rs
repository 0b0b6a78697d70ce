//! Kiwoom REST Adapters
//!
//! HTTP side of the brokerage integration:
//!
//! - `auth`: OAuth token issuance (`AuthEndpoint` implementation)
//! - `endpoints`: Endpoint id to path routing
//! - `client`: Rate-limited, retrying API client
//! - `pagination`: Lazy continuation-key pagination
//! - `error`: Error taxonomy

mod auth;
mod client;
mod endpoints;
mod error;
mod pagination;

pub use auth::{DEFAULT_TOKEN_LIFETIME, KiwoomAuthClient, OAuthTokenResponse, parse_expires_dt};
pub use client::{ApiRequest, KiwoomClient, KiwoomClientConfig, RawResponse};
pub use endpoints::{DEFAULT_ENDPOINTS, EndpointRegistry};
pub use error::{ApiError, ErrorKind};
pub use pagination::{PaginationLimits, Paginator, StopReason};

use serde_json::Value;

/// Read a Kiwoom `return_code`, sent as a number or a numeric string.
fn return_code(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
