//! Endpoint routing.
//!
//! Kiwoom identifies each REST operation by an `api-id` header and serves
//! groups of them from a shared path. The registry maps ids to paths and
//! refuses unknown ids before anything touches the network.

use std::collections::HashMap;

use super::error::ApiError;

/// Built-in endpoint table: `(api_id, path, purpose)`.
pub const DEFAULT_ENDPOINTS: &[(&str, &str, &str)] = &[
    ("ka10060", "/api/dostk/chart", "investor-by-stock chart"),
    ("ka10099", "/api/dostk/stkinfo", "stock list"),
    ("ka01690", "/api/dostk/acnt", "daily balance"),
    (
        "ka10059",
        "/uapi/domestic-stock/v1/quotations/inquire-investor-trading",
        "investor trading",
    ),
];

/// Map from endpoint id to request path.
#[derive(Debug, Clone)]
pub struct EndpointRegistry {
    paths: HashMap<String, String>,
}

impl EndpointRegistry {
    /// Registry with no endpoints.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            paths: HashMap::new(),
        }
    }

    /// Add or replace an endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, api_id: impl Into<String>, path: impl Into<String>) -> Self {
        self.paths.insert(api_id.into(), path.into());
        self
    }

    /// Path for `api_id`.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Configuration` for an unknown id.
    pub fn resolve(&self, api_id: &str) -> Result<&str, ApiError> {
        self.paths
            .get(api_id)
            .map(String::as_str)
            .ok_or_else(|| ApiError::Configuration(format!("unknown endpoint id: {api_id}")))
    }

    /// Whether `api_id` is registered.
    #[must_use]
    pub fn contains(&self, api_id: &str) -> bool {
        self.paths.contains_key(api_id)
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        DEFAULT_ENDPOINTS
            .iter()
            .fold(Self::empty(), |registry, (id, path, _)| {
                registry.with_endpoint(*id, *path)
            })
    }
}
