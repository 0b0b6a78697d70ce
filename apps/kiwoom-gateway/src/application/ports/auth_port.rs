//! Auth Endpoint Port (Driven Port)
//!
//! Issues fresh access tokens. The HTTP adapter talks to the brokerage
//! OAuth endpoint; tests substitute fakes.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::auth::Token;

/// Token acquisition errors.
///
/// `Clone` so a single refresh outcome can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Endpoint unreachable, timed out or returned a server error.
    #[error("auth endpoint unreachable: {0}")]
    Unreachable(String),

    /// Endpoint answered but refused to issue a token.
    #[error("auth rejected ({code}): {message}")]
    Rejected {
        /// Provider return code or HTTP status.
        code: String,
        /// Provider message.
        message: String,
    },

    /// Response could not be understood.
    #[error("invalid auth response: {0}")]
    InvalidResponse(String),

    /// Caller cancelled while waiting for a token.
    #[error("token request cancelled")]
    Cancelled,
}

impl AuthError {
    /// Whether retrying the request may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// Shared handle to an auth endpoint.
pub type SharedAuthEndpoint = Arc<dyn AuthEndpoint>;

/// Source of new access tokens.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthEndpoint: Send + Sync {
    /// Request a brand new token.
    async fn issue_token(&self) -> Result<Token, AuthError>;
}
