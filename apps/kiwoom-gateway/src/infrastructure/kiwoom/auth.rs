//! Kiwoom OAuth token client.
//!
//! Implements the `AuthEndpoint` port against `POST /oauth2/token` using
//! the client-credentials grant.
//!
//! # Response Format
//!
//! ```json
//! {"expires_dt":"20251203035221","token_type":"bearer","token":"...","return_code":0,"return_msg":"..."}
//! ```
//!
//! `expires_dt` is local Korea time (UTC+9). Some gateways send
//! `access_token` and `expires_in` instead; both are accepted.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeDelta, TimeZone, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::return_code;
use crate::application::ports::{AuthEndpoint, AuthError, SharedClock};
use crate::domain::auth::Token;
use crate::infrastructure::config::Credentials;

/// Token lifetime assumed when the response carries no expiry.
pub const DEFAULT_TOKEN_LIFETIME: TimeDelta = TimeDelta::seconds(86_400);

const KST_OFFSET_SECS: i32 = 9 * 3600;
const EXPIRES_DT_FORMAT: &str = "%Y%m%d%H%M%S";

#[derive(Serialize)]
struct TokenRequest<'a> {
    grant_type: &'static str,
    appkey: &'a str,
    secretkey: &'a str,
}

/// Raw token endpoint response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OAuthTokenResponse {
    /// Access token.
    #[serde(default, alias = "access_token")]
    pub token: Option<String>,
    /// Token type, usually `bearer`.
    #[serde(default)]
    pub token_type: Option<String>,
    /// Expiry as `yyyyMMddHHmmss` in Korea time.
    #[serde(default)]
    pub expires_dt: Option<String>,
    /// Lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// Provider return code; zero means success.
    #[serde(default)]
    pub return_code: Option<serde_json::Value>,
    /// Provider message.
    #[serde(default)]
    pub return_msg: Option<String>,
}

impl OAuthTokenResponse {
    /// Convert into a token issued at `now`.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Rejected` for a non-zero return code or a
    /// missing token, and `AuthError::InvalidResponse` for an unreadable
    /// expiry.
    pub fn into_token(self, now: DateTime<Utc>) -> Result<Token, AuthError> {
        let code = self.return_code.as_ref().and_then(return_code);
        if let Some(code) = code.filter(|code| *code != 0) {
            return Err(AuthError::Rejected {
                code: code.to_string(),
                message: self.return_msg.unwrap_or_default(),
            });
        }

        let Some(value) = self.token.filter(|t| !t.trim().is_empty()) else {
            return Err(AuthError::Rejected {
                code: code.map_or_else(|| "missing_token".to_string(), |c| c.to_string()),
                message: self
                    .return_msg
                    .unwrap_or_else(|| "response carried no token".to_string()),
            });
        };

        let expires_at = match (self.expires_dt.as_deref(), self.expires_in) {
            (Some(dt), _) if !dt.trim().is_empty() => parse_expires_dt(dt)?,
            (_, Some(secs)) => TimeDelta::try_seconds(secs)
                .and_then(|lifetime| now.checked_add_signed(lifetime))
                .ok_or_else(|| {
                    AuthError::InvalidResponse(format!("expires_in {secs} is out of range"))
                })?,
            _ => now
                .checked_add_signed(DEFAULT_TOKEN_LIFETIME)
                .ok_or_else(|| AuthError::InvalidResponse("expiry out of range".to_string()))?,
        };

        let token_type = self
            .token_type
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| "Bearer".to_string());

        Token::new(value, token_type, now, expires_at)
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))
    }
}

/// Parse a Kiwoom `expires_dt` (`yyyyMMddHHmmss`, Korea time).
///
/// # Errors
///
/// Returns `AuthError::InvalidResponse` if the value does not match the
/// format.
pub fn parse_expires_dt(value: &str) -> Result<DateTime<Utc>, AuthError> {
    let naive = NaiveDateTime::parse_from_str(value.trim(), EXPIRES_DT_FORMAT)
        .map_err(|e| AuthError::InvalidResponse(format!("expires_dt {value:?}: {e}")))?;
    let kst = FixedOffset::east_opt(KST_OFFSET_SECS)
        .ok_or_else(|| AuthError::InvalidResponse("invalid KST offset".to_string()))?;
    kst.from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| AuthError::InvalidResponse(format!("expires_dt {value:?} is ambiguous")))
}

/// HTTP client for the Kiwoom token endpoint.
pub struct KiwoomAuthClient {
    http: Client,
    token_url: String,
    credentials: Credentials,
    clock: SharedClock,
}

impl KiwoomAuthClient {
    /// Create a client for `auth_base_url`.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Unreachable` if the HTTP client cannot be built.
    pub fn new(
        auth_base_url: &str,
        credentials: Credentials,
        timeout: Duration,
        clock: SharedClock,
    ) -> Result<Self, AuthError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        Ok(Self {
            http,
            token_url: format!("{}/oauth2/token", auth_base_url.trim_end_matches('/')),
            credentials,
            clock,
        })
    }
}

impl std::fmt::Debug for KiwoomAuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KiwoomAuthClient")
            .field("token_url", &self.token_url)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthEndpoint for KiwoomAuthClient {
    async fn issue_token(&self) -> Result<Token, AuthError> {
        let request = TokenRequest {
            grant_type: "client_credentials",
            appkey: self.credentials.app_key(),
            secretkey: self.credentials.secret_key(),
        };

        let response = self
            .http
            .post(&self.token_url)
            .header("Content-Type", "application/json;charset=UTF-8")
            .json(&request)
            .send()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        if status.is_server_error() || status.as_u16() == 429 {
            return Err(AuthError::Unreachable(format!("status {status}: {body}")));
        }
        if !status.is_success() {
            return Err(AuthError::Rejected {
                code: status.as_u16().to_string(),
                message: body,
            });
        }

        let parsed: OAuthTokenResponse = serde_json::from_str(&body)
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
        parsed.into_token(self.clock.now())
    }
}
