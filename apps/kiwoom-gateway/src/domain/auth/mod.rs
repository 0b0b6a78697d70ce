//! Access Token Types
//!
//! Bearer tokens issued by the brokerage OAuth endpoint and the status
//! derived from them. Tokens are immutable snapshots: a refresh replaces
//! the whole value, nothing is updated in place.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Errors
// =============================================================================

/// Errors raised when constructing a token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// Token value was empty.
    #[error("token value cannot be empty")]
    EmptyValue,

    /// Expiry is not after issue time.
    #[error("token expires at {expires_at} which is not after issue time {issued_at}")]
    NonPositiveLifetime {
        /// When the token was issued.
        issued_at: DateTime<Utc>,
        /// When the token expires.
        expires_at: DateTime<Utc>,
    },
}

// =============================================================================
// Token
// =============================================================================

/// An OAuth bearer token with its validity window.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TokenRecord")]
pub struct Token {
    value: String,
    token_type: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Unchecked wire shape used while deserializing a stored token.
#[derive(Deserialize)]
struct TokenRecord {
    value: String,
    token_type: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<TokenRecord> for Token {
    type Error = TokenError;

    fn try_from(record: TokenRecord) -> Result<Self, Self::Error> {
        Self::new(
            record.value,
            record.token_type,
            record.issued_at,
            record.expires_at,
        )
    }
}

impl Token {
    /// Create a token.
    ///
    /// # Errors
    ///
    /// Returns `TokenError` if the value is empty or `expires_at` is not
    /// strictly after `issued_at`.
    pub fn new(
        value: impl Into<String>,
        token_type: impl Into<String>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Self, TokenError> {
        let value = value.into();
        if value.is_empty() {
            return Err(TokenError::EmptyValue);
        }
        if expires_at <= issued_at {
            return Err(TokenError::NonPositiveLifetime {
                issued_at,
                expires_at,
            });
        }

        Ok(Self {
            value,
            token_type: token_type.into(),
            issued_at,
            expires_at,
        })
    }

    /// The opaque token string.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Token type as reported by the issuer (usually `Bearer`).
    #[must_use]
    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    /// Issue time.
    #[must_use]
    pub const fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// Expiry time.
    #[must_use]
    pub const fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Total lifetime between issue and expiry.
    #[must_use]
    pub fn lifetime(&self) -> TimeDelta {
        self.expires_at - self.issued_at
    }

    /// Remaining lifetime at `now`. Negative once expired.
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> TimeDelta {
        self.expires_at - now
    }

    /// Whether the token is past its expiry at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether the remaining lifetime has dropped below the refresh margin.
    #[must_use]
    pub fn is_expiring_soon(&self, now: DateTime<Utc>, margin: &RefreshMargin) -> bool {
        self.remaining(now) < margin.window_for(self)
    }

    /// Value for the `authorization` request header.
    #[must_use]
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.value)
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("value", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// =============================================================================
// Refresh Margin
// =============================================================================

/// Safety window before expiry in which a token is treated as expiring soon.
///
/// The window is the larger of a fixed threshold and a fraction of the
/// token's total lifetime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefreshMargin {
    threshold: Duration,
    lifetime_fraction: f64,
}

impl RefreshMargin {
    /// Default fixed threshold (5 minutes).
    pub const DEFAULT_THRESHOLD: Duration = Duration::from_secs(300);

    /// Margin with only a fixed threshold.
    #[must_use]
    pub const fn fixed(threshold: Duration) -> Self {
        Self {
            threshold,
            lifetime_fraction: 0.0,
        }
    }

    /// Also treat the last `fraction` of the lifetime as expiring soon.
    ///
    /// Values are clamped to `0.0..=1.0`.
    #[must_use]
    pub fn with_lifetime_fraction(mut self, fraction: f64) -> Self {
        self.lifetime_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    /// Fixed threshold.
    #[must_use]
    pub const fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Lifetime fraction.
    #[must_use]
    pub const fn lifetime_fraction(&self) -> f64 {
        self.lifetime_fraction
    }

    /// Effective window for a given token.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn window_for(&self, token: &Token) -> TimeDelta {
        let fixed = TimeDelta::from_std(self.threshold).unwrap_or(TimeDelta::MAX);
        let lifetime_ms = token.lifetime().num_milliseconds() as f64;
        let proportional =
            TimeDelta::milliseconds((lifetime_ms * self.lifetime_fraction) as i64);
        fixed.max(proportional)
    }
}

impl Default for RefreshMargin {
    fn default() -> Self {
        Self::fixed(Self::DEFAULT_THRESHOLD)
    }
}

// =============================================================================
// Token Status
// =============================================================================

/// Derived view of the current token. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TokenStatus {
    /// A token is cached.
    pub exists: bool,
    /// The cached token has not expired.
    pub valid: bool,
    /// The cached token is inside the refresh margin.
    pub expiring_soon: bool,
}

impl TokenStatus {
    /// Status when no token is cached.
    #[must_use]
    pub const fn missing() -> Self {
        Self {
            exists: false,
            valid: false,
            expiring_soon: false,
        }
    }

    /// Evaluate a token snapshot at `now`.
    #[must_use]
    pub fn evaluate(token: Option<&Token>, now: DateTime<Utc>, margin: &RefreshMargin) -> Self {
        token.map_or_else(Self::missing, |token| Self {
            exists: true,
            valid: !token.is_expired(now),
            expiring_soon: token.is_expiring_soon(now, margin),
        })
    }

    /// Whether a caller asking for a usable token would trigger a refresh.
    #[must_use]
    pub const fn needs_refresh(&self) -> bool {
        !self.exists || !self.valid || self.expiring_soon
    }
}

// =============================================================================
// Tests
// =============================================================================
