//! Rate-limited, retrying Kiwoom REST client.
//!
//! Every network attempt goes through the same three steps: wait for a
//! permit from the shared rate limiter, attach a valid access token, send.
//! Attempts run under the retry executor, so retries are spaced by both the
//! backoff and the rate limiter.
//!
//! A 401 invalidates the token that was sent and earns one more full retry
//! cycle with a fresh token. A second 401 is returned to the caller.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::endpoints::EndpointRegistry;
use super::error::ApiError;
use super::pagination::{PaginationLimits, Paginator};
use super::return_code;
use crate::application::services::TokenManager;
use crate::domain::pagination::ContinuationCursor;
use crate::infrastructure::config::Credentials;
use crate::infrastructure::metrics::{self, CallOutcome};
use crate::resilience::{RetryError, RetryExecutor, RetryPolicy, SharedRateLimiter};

const JSON_CONTENT_TYPE: &str = "application/json;charset=UTF-8";

// =============================================================================
// Request / Response
// =============================================================================

/// A call to one Kiwoom endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    /// Endpoint id sent as `api-id` (e.g. `ka10099`).
    pub endpoint_id: String,
    /// HTTP method.
    pub method: Method,
    /// Query string parameters.
    pub params: Vec<(String, String)>,
    /// JSON body.
    pub body: Option<Value>,
}

impl ApiRequest {
    /// `POST` with a JSON body, the shape most Kiwoom endpoints use.
    #[must_use]
    pub fn post(endpoint_id: impl Into<String>, body: Value) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            method: Method::POST,
            params: Vec::new(),
            body: Some(body),
        }
    }

    /// `GET` without a body.
    #[must_use]
    pub fn get(endpoint_id: impl Into<String>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            method: Method::GET,
            params: Vec::new(),
            body: None,
        }
    }

    /// Add a query parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }
}

/// A successful response.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    /// HTTP status.
    pub status: u16,
    /// Parsed JSON body (`Null` when empty).
    pub body: Value,
    /// Continuation headers of this response.
    pub cursor: ContinuationCursor,
}

// =============================================================================
// Client
// =============================================================================

/// Client settings.
#[derive(Debug, Clone)]
pub struct KiwoomClientConfig {
    /// REST base URL without trailing slash.
    pub base_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retry policy for each call.
    pub retry: RetryPolicy,
    /// Bounds for paginated calls.
    pub pagination: PaginationLimits,
}

impl Default for KiwoomClientConfig {
    fn default() -> Self {
        Self {
            base_url: crate::infrastructure::config::DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::conservative(),
            pagination: PaginationLimits::default(),
        }
    }
}

/// Kiwoom REST client. Cheap to clone.
#[derive(Clone)]
pub struct KiwoomClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http: Client,
    config: KiwoomClientConfig,
    credentials: Credentials,
    registry: EndpointRegistry,
    tokens: TokenManager,
    limiter: SharedRateLimiter,
}

impl KiwoomClient {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Configuration` if the HTTP client cannot be built.
    pub fn new(
        config: KiwoomClientConfig,
        credentials: Credentials,
        registry: EndpointRegistry,
        tokens: TokenManager,
        limiter: SharedRateLimiter,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ApiError::Configuration(format!("http client: {e}")))?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                config: KiwoomClientConfig {
                    base_url: config.base_url.trim_end_matches('/').to_string(),
                    ..config
                },
                credentials,
                registry,
                tokens,
                limiter,
            }),
        })
    }

    /// Perform one call.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Configuration` for an unknown endpoint id without
    /// touching the network, the last error once retries are exhausted, or
    /// `ApiError::Cancelled`.
    pub async fn call(
        &self,
        request: &ApiRequest,
        cancel: &CancellationToken,
    ) -> Result<RawResponse, ApiError> {
        self.call_with_cursor(request, &ContinuationCursor::initial(), cancel)
            .await
    }

    /// Lazily fetch every page of a paginated call.
    ///
    /// Nothing is sent until the first `next_page().await`.
    #[must_use]
    pub fn call_paginated(&self, request: ApiRequest, cancel: CancellationToken) -> Paginator {
        Paginator::new(
            self.clone(),
            request,
            cancel,
            self.inner.config.pagination,
        )
    }

    /// Token manager used for authorization headers.
    #[must_use]
    pub fn tokens(&self) -> &TokenManager {
        &self.inner.tokens
    }

    /// Perform one call carrying `cursor`.
    pub(crate) async fn call_with_cursor(
        &self,
        request: &ApiRequest,
        cursor: &ContinuationCursor,
        cancel: &CancellationToken,
    ) -> Result<RawResponse, ApiError> {
        let endpoint_id = request.endpoint_id.as_str();
        let path = self.inner.registry.resolve(endpoint_id)?;
        let url = format!("{}{path}", self.inner.config.base_url);

        let mut reauthenticated = false;
        let result = loop {
            match self.retrying(request, &url, cursor, cancel).await {
                Err(ApiError::AuthExpired) if !reauthenticated => {
                    reauthenticated = true;
                    tracing::warn!(
                        endpoint = endpoint_id,
                        "Access token rejected, retrying once with a fresh token"
                    );
                }
                other => break other,
            }
        };

        let outcome = match &result {
            Ok(_) => CallOutcome::Success,
            Err(ApiError::Cancelled) => CallOutcome::Cancelled,
            Err(_) => CallOutcome::Failure,
        };
        metrics::record_api_request(endpoint_id, outcome);

        if let Err(e) = &result {
            tracing::warn!(endpoint = endpoint_id, error = %e, kind = ?e.kind(), "API call failed");
        }
        result
    }

    async fn retrying(
        &self,
        request: &ApiRequest,
        url: &str,
        cursor: &ContinuationCursor,
        cancel: &CancellationToken,
    ) -> Result<RawResponse, ApiError> {
        let executor = RetryExecutor::new(self.inner.config.retry);
        executor
            .run(cancel, ApiError::retry_decision, |attempt| async move {
                if attempt > 1 {
                    metrics::record_api_retry(&request.endpoint_id);
                }
                self.attempt(request, url, cursor, cancel).await
            })
            .await
            .map_err(|e| match e {
                RetryError::Failed { error, .. } => error,
                RetryError::Cancelled { .. } => ApiError::Cancelled,
            })
    }

    async fn attempt(
        &self,
        request: &ApiRequest,
        url: &str,
        cursor: &ContinuationCursor,
        cancel: &CancellationToken,
    ) -> Result<RawResponse, ApiError> {
        let inner = &self.inner;

        // A refresh takes its own permit; acquiring ours afterwards keeps the
        // auth call and this request spaced by the limiter too.
        let token = inner.tokens.get_valid_token(cancel).await?;
        inner
            .limiter
            .acquire(cancel)
            .await
            .map_err(|_| ApiError::Cancelled)?;

        let mut builder = inner
            .http
            .request(request.method.clone(), url)
            .header(AUTHORIZATION, token.authorization_header())
            .header("appkey", inner.credentials.app_key())
            .header("appsecret", inner.credentials.secret_key())
            .header("api-id", request.endpoint_id.as_str())
            .header("cont-yn", cursor.cont_yn().as_str())
            .header("next-key", cursor.next_key())
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE);
        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        tracing::debug!(
            endpoint = %request.endpoint_id,
            cont_yn = cursor.cont_yn().as_str(),
            "Sending API request"
        );

        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::from_transport(&e))?;
        let status = response.status();
        let next_cursor = cursor_from(response.headers());
        let text = response
            .text()
            .await
            .map_err(|e| ApiError::from_transport(&e))?;

        if status == StatusCode::UNAUTHORIZED {
            inner.tokens.invalidate_if_current(token.value()).await;
            return Err(ApiError::AuthExpired);
        }
        if !status.is_success() {
            return Err(ApiError::from_status(status, &text));
        }

        let body = parse_body(&text)?;
        if let Some(code) = return_code_of(&body).filter(|code| *code != 0) {
            let message = body
                .get("return_msg")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Err(ApiError::Rejected {
                status: u16::try_from(code).unwrap_or_else(|_| status.as_u16()),
                message,
            });
        }

        Ok(RawResponse {
            status: status.as_u16(),
            body,
            cursor: next_cursor,
        })
    }
}

impl std::fmt::Debug for KiwoomClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KiwoomClient")
            .field("base_url", &self.inner.config.base_url)
            .field("retry", &self.inner.config.retry.name())
            .finish_non_exhaustive()
    }
}

fn cursor_from(headers: &HeaderMap) -> ContinuationCursor {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    ContinuationCursor::from_headers(header("cont-yn"), header("next-key"))
}

fn parse_body(text: &str) -> Result<Value, ApiError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text).map_err(|e| ApiError::Protocol(format!("invalid JSON body: {e}")))
}

fn return_code_of(body: &Value) -> Option<i64> {
    body.get("return_code").and_then(return_code)
}
