//! Kiwoom API error types.

use reqwest::StatusCode;
use thiserror::Error;

use crate::application::ports::AuthError;
use crate::resilience::RetryDecision;

/// Coarse failure taxonomy for callers and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Temporary network or server condition.
    Transient,
    /// Credentials or token problem.
    Auth,
    /// Caller or deployment misconfiguration.
    Configuration,
    /// Unexpected response shape.
    Protocol,
    /// Request refused by the provider.
    Rejected,
    /// Cancelled by the caller.
    Cancelled,
}

/// Errors from the brokerage API client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// Timeout, connection failure, 429, 500 or 503.
    #[error("transient network error (status {status:?}): {message}")]
    TransientNetwork {
        /// HTTP status when a response was received.
        status: Option<u16>,
        /// Error detail.
        message: String,
    },

    /// The access token was rejected (401).
    #[error("access token expired or rejected")]
    AuthExpired,

    /// Unknown endpoint id or invalid request setup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Response body could not be parsed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Non-retryable HTTP status or non-zero return code.
    #[error("request rejected ({status}): {message}")]
    Rejected {
        /// HTTP status or provider return code.
        status: u16,
        /// Provider message.
        message: String,
    },

    /// Could not obtain an access token.
    #[error(transparent)]
    Auth(AuthError),

    /// Cancelled by the caller.
    #[error("request cancelled")]
    Cancelled,
}

impl ApiError {
    /// Taxonomy bucket of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientNetwork { .. } => ErrorKind::Transient,
            Self::AuthExpired | Self::Auth(AuthError::Rejected { .. }) => ErrorKind::Auth,
            Self::Auth(AuthError::Unreachable(_)) => ErrorKind::Transient,
            Self::Auth(AuthError::InvalidResponse(_)) | Self::Protocol(_) => ErrorKind::Protocol,
            Self::Auth(AuthError::Cancelled) | Self::Cancelled => ErrorKind::Cancelled,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Rejected { .. } => ErrorKind::Rejected,
        }
    }

    /// Retry decision for the retry executor.
    ///
    /// Token acquisition failures are already retried by the token manager
    /// and are not retried again here.
    #[must_use]
    pub const fn retry_decision(&self) -> RetryDecision {
        match self {
            Self::TransientNetwork { .. } => RetryDecision::Retry,
            _ => RetryDecision::Fatal,
        }
    }

    /// Whether the retry executor should retry this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.retry_decision(), RetryDecision::Retry)
    }

    /// Map a non-success HTTP status.
    #[must_use]
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = if body.is_empty() {
            status
                .canonical_reason()
                .unwrap_or("unknown status")
                .to_string()
        } else {
            body.chars().take(512).collect()
        };

        match status.as_u16() {
            401 => Self::AuthExpired,
            429 | 500 | 503 => Self::TransientNetwork {
                status: Some(status.as_u16()),
                message,
            },
            code => Self::Rejected {
                status: code,
                message,
            },
        }
    }

    /// Map a transport error.
    #[must_use]
    pub fn from_transport(error: &reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() || error.is_request() {
            Self::TransientNetwork {
                status: None,
                message: error.to_string(),
            }
        } else if error.is_decode() || error.is_body() {
            Self::Protocol(error.to_string())
        } else {
            Self::TransientNetwork {
                status: error.status().map(|s| s.as_u16()),
                message: error.to_string(),
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        match error {
            AuthError::Cancelled => Self::Cancelled,
            other => Self::Auth(other),
        }
    }
}
