//! Access Token Lifecycle
//!
//! Acquires, caches, persists and refreshes the brokerage access token.
//!
//! # Lookup Order
//!
//! 1. In-process cache
//! 2. Token store (survives restarts, shared between instances)
//! 3. Refresh against the auth endpoint
//!
//! A token inside the refresh margin counts as missing. At most one refresh
//! per store key is in flight at a time; concurrent callers attach to it.
//! The refresh runs as a detached task so a cancelled caller does not abort
//! it for the others.
//!
//! An invalidated token value is remembered until a different token
//! replaces it, so a store read racing the delete cannot bring it back.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use super::single_flight::SingleFlight;
use crate::application::ports::{AuthError, SharedAuthEndpoint, SharedClock, SharedStore};
use crate::domain::auth::{RefreshMargin, Token, TokenStatus};
use crate::infrastructure::metrics;
use crate::resilience::{RetryDecision, RetryError, RetryExecutor, RetryPolicy, SharedRateLimiter};

/// Store key holding the serialized token.
pub const TOKEN_STORE_KEY: &str = "kiwoom:auth:token";

/// Token manager settings.
#[derive(Debug, Clone)]
pub struct TokenManagerConfig {
    /// Store key for the persisted token.
    pub store_key: String,
    /// Window before expiry that triggers a proactive refresh.
    pub margin: RefreshMargin,
    /// Retry policy for refresh calls.
    pub retry: RetryPolicy,
}

impl Default for TokenManagerConfig {
    fn default() -> Self {
        Self {
            store_key: TOKEN_STORE_KEY.to_string(),
            margin: RefreshMargin::default(),
            retry: RetryPolicy::fast(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum FlightKind {
    /// Return a usable token, refreshing only if needed.
    Ensure,
    /// Always call the auth endpoint.
    Refresh,
}

/// Cached token plus the last value the provider rejected.
#[derive(Default)]
struct TokenSlot {
    current: Option<Token>,
    revoked: Option<String>,
}

impl TokenSlot {
    fn revoke(&mut self, token: &Token) {
        self.revoked = Some(token.value().to_string());
    }

    fn is_revoked(&self, token: &Token) -> bool {
        self.revoked.as_deref() == Some(token.value())
    }
}

/// Owner of the current access token. Cheap to clone.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: SharedAuthEndpoint,
    store: SharedStore,
    clock: SharedClock,
    limiter: SharedRateLimiter,
    config: TokenManagerConfig,
    slot: RwLock<TokenSlot>,
    issued: AtomicU64,
    flights: SingleFlight<Token, AuthError>,
    shutdown: CancellationToken,
}

impl TokenManager {
    /// Create a token manager.
    ///
    /// `shutdown` bounds detached refresh tasks; individual callers pass
    /// their own cancellation token to each method.
    #[must_use]
    pub fn new(
        endpoint: SharedAuthEndpoint,
        store: SharedStore,
        clock: SharedClock,
        limiter: SharedRateLimiter,
        config: TokenManagerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoint,
                store,
                clock,
                limiter,
                config,
                slot: RwLock::new(TokenSlot::default()),
                issued: AtomicU64::new(0),
                flights: SingleFlight::new(),
                shutdown,
            }),
        }
    }

    /// Return a token that is not expiring soon, refreshing first if needed.
    ///
    /// # Errors
    ///
    /// Returns `AuthError` if the refresh fails after retries, or
    /// `AuthError::Cancelled` if `cancel` fires first.
    pub async fn get_valid_token(&self, cancel: &CancellationToken) -> Result<Token, AuthError> {
        if let Some(token) = self.inner.usable_cached() {
            return Ok(token);
        }
        self.coalesce(cancel, FlightKind::Ensure).await
    }

    /// Fetch a brand new token and persist it.
    ///
    /// Joins a refresh already in flight rather than starting a second one.
    /// A joined flight that served the cache or the store without issuing
    /// does not count; the call then starts its own refresh.
    ///
    /// # Errors
    ///
    /// Returns `AuthError` if the refresh fails after retries, or
    /// `AuthError::Cancelled` if `cancel` fires first.
    pub async fn refresh_token(&self, cancel: &CancellationToken) -> Result<Token, AuthError> {
        let issued_before = self.inner.issued.load(Ordering::Acquire);
        loop {
            let token = self.coalesce(cancel, FlightKind::Refresh).await?;
            if self.inner.issued.load(Ordering::Acquire) > issued_before {
                return Ok(token);
            }
            tracing::debug!("Joined flight did not issue a token, refreshing again");
        }
    }

    /// Status of the cached token. Never touches the network or the store.
    #[must_use]
    pub fn check_status(&self) -> TokenStatus {
        let slot = self.inner.slot.read();
        TokenStatus::evaluate(
            slot.current.as_ref(),
            self.inner.clock.now(),
            &self.inner.config.margin,
        )
    }

    /// Drop the cached and stored token.
    pub async fn invalidate(&self) {
        {
            let mut slot = self.inner.slot.write();
            if let Some(token) = slot.current.take() {
                slot.revoke(&token);
            }
        }
        self.inner.delete_stored().await;
        tracing::info!("Access token invalidated");
    }

    /// Drop the token only if it is still the one with `value`.
    ///
    /// Returns whether anything was invalidated. A caller holding a token
    /// that has already been replaced leaves the replacement alone.
    pub async fn invalidate_if_current(&self, value: &str) -> bool {
        let matched = {
            let mut slot = self.inner.slot.write();
            match slot.current.take() {
                Some(token) if token.value() == value => {
                    slot.revoke(&token);
                    true
                }
                other => {
                    slot.current = other;
                    false
                }
            }
        };

        if matched {
            self.inner.delete_stored().await;
            tracing::info!("Rejected access token invalidated");
        }
        matched
    }

    /// Margin used to decide when a token is expiring soon.
    #[must_use]
    pub fn margin(&self) -> RefreshMargin {
        self.inner.config.margin
    }

    async fn coalesce(
        &self,
        cancel: &CancellationToken,
        kind: FlightKind,
    ) -> Result<Token, AuthError> {
        let inner = Arc::clone(&self.inner);
        let flight = self
            .inner
            .flights
            .run(&self.inner.config.store_key, move || spawn_flight(inner, kind));

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AuthError::Cancelled),
            result = flight => result,
        }
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("store_key", &self.inner.config.store_key)
            .field("status", &self.check_status())
            .finish_non_exhaustive()
    }
}

fn spawn_flight(inner: Arc<Inner>, kind: FlightKind) -> BoxFuture<'static, Result<Token, AuthError>> {
    let handle = tokio::spawn(async move {
        match kind {
            FlightKind::Ensure => inner.ensure().await,
            FlightKind::Refresh => inner.refresh().await,
        }
    });

    async move {
        handle.await.unwrap_or_else(|e| {
            Err(AuthError::Unreachable(format!(
                "token refresh task failed: {e}"
            )))
        })
    }
    .boxed()
}

impl Inner {
    fn usable_cached(&self) -> Option<Token> {
        let now = self.clock.now();
        self.slot
            .read()
            .current
            .as_ref()
            .filter(|token| !token.is_expiring_soon(now, &self.config.margin))
            .cloned()
    }

    async fn ensure(&self) -> Result<Token, AuthError> {
        if let Some(token) = self.usable_cached() {
            return Ok(token);
        }

        if let Some(token) = self.load_stored().await
            && self.adopt_stored(&token)
        {
            tracing::debug!(expires_at = %token.expires_at(), "Using stored access token");
            return Ok(token);
        }

        self.refresh().await
    }

    async fn refresh(&self) -> Result<Token, AuthError> {
        let executor = RetryExecutor::new(self.config.retry);
        let classify = |error: &AuthError| {
            if error.is_transient() {
                RetryDecision::Retry
            } else {
                RetryDecision::Fatal
            }
        };

        let result = executor
            .run(&self.shutdown, classify, |attempt| async move {
                self.limiter
                    .acquire(&self.shutdown)
                    .await
                    .map_err(|_| AuthError::Cancelled)?;
                tracing::debug!(attempt, "Requesting access token");
                self.endpoint.issue_token().await
            })
            .await;

        let token = match result {
            Ok(token) => token,
            Err(RetryError::Failed { attempts, error }) => {
                metrics::record_token_refresh(false);
                tracing::error!(error = %error, attempts, "Access token refresh failed");
                return Err(error);
            }
            Err(RetryError::Cancelled { .. }) => return Err(AuthError::Cancelled),
        };

        metrics::record_token_refresh(true);
        {
            let mut slot = self.slot.write();
            if slot.is_revoked(&token) {
                slot.revoked = None;
            }
            slot.current = Some(token.clone());
        }
        self.issued.fetch_add(1, Ordering::AcqRel);
        self.persist(&token).await;

        let now = self.clock.now();
        if token.is_expiring_soon(now, &self.config.margin) {
            tracing::warn!(
                expires_at = %token.expires_at(),
                "Issued token is already inside the refresh margin"
            );
        }
        tracing::info!(expires_at = %token.expires_at(), "Access token refreshed");
        Ok(token)
    }

    /// Cache a token read from the store unless it was invalidated meanwhile.
    fn adopt_stored(&self, token: &Token) -> bool {
        let mut slot = self.slot.write();
        if slot.is_revoked(token) {
            tracing::debug!("Stored access token was invalidated, ignoring it");
            return false;
        }
        slot.current = Some(token.clone());
        true
    }

    async fn load_stored(&self) -> Option<Token> {
        let raw = match self.store.get(&self.config.store_key).await {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!(error = %e, "Token store read failed");
                return None;
            }
        };

        match serde_json::from_str::<Token>(&raw) {
            Ok(token) if !token.is_expiring_soon(self.clock.now(), &self.config.margin) => {
                Some(token)
            }
            Ok(_) => {
                tracing::debug!("Stored access token is expiring, ignoring it");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Stored access token is unreadable, ignoring it");
                None
            }
        }
    }

    async fn persist(&self, token: &Token) {
        let Some(ttl) = token
            .remaining(self.clock.now())
            .to_std()
            .ok()
            .filter(|ttl| !ttl.is_zero())
        else {
            tracing::warn!("Issued access token already expired, not persisting");
            return;
        };

        let json = match serde_json::to_string(token) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize access token");
                return;
            }
        };

        if let Err(e) = self.store.set(&self.config.store_key, &json, Some(ttl)).await {
            tracing::warn!(error = %e, "Failed to persist access token");
        }
    }

    async fn delete_stored(&self) {
        if let Err(e) = self.store.delete(&self.config.store_key).await {
            tracing::warn!(error = %e, "Failed to delete stored access token");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};

    use super::*;
    use crate::application::ports::{
        AuthEndpoint, KeyValueStore, ManualClock, MockAuthEndpoint, StoreError,
    };
    use crate::infrastructure::store::InMemoryStore;
    use crate::resilience::RateLimiter;

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 12, 3, 0, 0, 0).unwrap()
    }

    fn day_token(value: &str, issued_at: DateTime<Utc>) -> Token {
        Token::new(value, "Bearer", issued_at, issued_at + TimeDelta::hours(24)).unwrap()
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy::new("test", 2, Duration::from_millis(1), 2.0, Duration::from_millis(2))
    }

    struct Harness {
        manager: TokenManager,
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn harness(endpoint: impl AuthEndpoint + 'static) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(start_time()));
        let manager = TokenManager::new(
            Arc::new(endpoint),
            store.clone(),
            clock.clone(),
            RateLimiter::shared(1_000.0).unwrap(),
            TokenManagerConfig {
                retry: quick_retry(),
                ..TokenManagerConfig::default()
            },
            CancellationToken::new(),
        );
        Harness {
            manager,
            store,
            clock,
        }
    }

    /// Endpoint that takes a while to answer and counts calls.
    struct SlowEndpoint {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl AuthEndpoint for SlowEndpoint {
        async fn issue_token(&self) -> Result<Token, AuthError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(100)).await;
            if self.fail {
                Err(AuthError::Rejected {
                    code: "8005".to_string(),
                    message: "invalid app key".to_string(),
                })
            } else {
                Ok(day_token(&format!("token-{call}"), start_time()))
            }
        }
    }

    #[tokio::test]
    async fn refreshes_when_empty_and_persists_with_remaining_ttl() {
        let mut endpoint = MockAuthEndpoint::new();
        endpoint
            .expect_issue_token()
            .times(1)
            .returning(|| Ok(day_token("fresh", start_time())));
        let h = harness(endpoint);
        let cancel = CancellationToken::new();

        let token = h.manager.get_valid_token(&cancel).await.unwrap();
        assert_eq!(token.value(), "fresh");

        let stored = h.store.get(TOKEN_STORE_KEY).await.unwrap().unwrap();
        assert_eq!(serde_json::from_str::<Token>(&stored).unwrap(), token);
        assert_eq!(h.store.ttl_of(TOKEN_STORE_KEY), Some(Duration::from_secs(86_400)));
    }

    #[tokio::test]
    async fn cached_token_is_reused() {
        let mut endpoint = MockAuthEndpoint::new();
        endpoint
            .expect_issue_token()
            .times(1)
            .returning(|| Ok(day_token("fresh", start_time())));
        let h = harness(endpoint);
        let cancel = CancellationToken::new();

        let first = h.manager.get_valid_token(&cancel).await.unwrap();
        let second = h.manager.get_valid_token(&cancel).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn stored_token_is_used_after_restart() {
        let mut endpoint = MockAuthEndpoint::new();
        endpoint.expect_issue_token().never();
        let h = harness(endpoint);
        let stored = day_token("persisted", start_time());
        h.store
            .set(
                TOKEN_STORE_KEY,
                &serde_json::to_string(&stored).unwrap(),
                None,
            )
            .await
            .unwrap();

        let token = h
            .manager
            .get_valid_token(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(token.value(), "persisted");
        assert!(h.manager.check_status().valid);
    }

    #[tokio::test]
    async fn expiring_token_is_refreshed_proactively() {
        let mut endpoint = MockAuthEndpoint::new();
        let mut seq = mockall::Sequence::new();
        endpoint
            .expect_issue_token()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(day_token("first", start_time())));
        endpoint
            .expect_issue_token()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| {
                Ok(day_token(
                    "second",
                    start_time() + TimeDelta::hours(24) - TimeDelta::seconds(30),
                ))
            });
        let h = harness(endpoint);
        let cancel = CancellationToken::new();

        assert_eq!(h.manager.get_valid_token(&cancel).await.unwrap().value(), "first");

        // 30 seconds before expiry is inside the 5 minute margin.
        h.clock
            .advance(TimeDelta::hours(24) - TimeDelta::seconds(30));
        let status = h.manager.check_status();
        assert!(status.valid);
        assert!(status.expiring_soon);

        assert_eq!(h.manager.get_valid_token(&cancel).await.unwrap().value(), "second");
        assert!(!h.manager.check_status().expiring_soon);
    }

    #[tokio::test]
    async fn invalidate_forces_refresh() {
        let mut endpoint = MockAuthEndpoint::new();
        endpoint
            .expect_issue_token()
            .times(2)
            .returning(|| Ok(day_token("fresh", start_time())));
        let h = harness(endpoint);
        let cancel = CancellationToken::new();

        h.manager.get_valid_token(&cancel).await.unwrap();
        h.manager.invalidate().await;

        assert_eq!(h.manager.check_status(), TokenStatus::missing());
        assert!(!h.store.exists(TOKEN_STORE_KEY).await.unwrap());

        h.manager.get_valid_token(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn invalidate_if_current_ignores_replaced_token() {
        let mut endpoint = MockAuthEndpoint::new();
        endpoint
            .expect_issue_token()
            .times(1)
            .returning(|| Ok(day_token("current", start_time())));
        let h = harness(endpoint);
        h.manager
            .get_valid_token(&CancellationToken::new())
            .await
            .unwrap();

        assert!(!h.manager.invalidate_if_current("stale").await);
        assert!(h.manager.check_status().exists);

        assert!(h.manager.invalidate_if_current("current").await);
        assert!(!h.manager.check_status().exists);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_surfaced() {
        let mut endpoint = MockAuthEndpoint::new();
        endpoint
            .expect_issue_token()
            .times(2)
            .returning(|| Err(AuthError::Unreachable("connection refused".to_string())));
        let h = harness(endpoint);

        let err = h
            .manager
            .get_valid_token(&CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::Unreachable("connection refused".to_string()));
        assert!(!h.manager.check_status().exists);
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let mut endpoint = MockAuthEndpoint::new();
        endpoint.expect_issue_token().times(1).returning(|| {
            Err(AuthError::Rejected {
                code: "8001".to_string(),
                message: "bad secret".to_string(),
            })
        });
        let h = harness(endpoint);

        let err = h
            .manager
            .refresh_token(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Rejected { .. }));
    }

    #[tokio::test]
    async fn concurrent_callers_trigger_one_refresh() {
        let endpoint = Arc::new(SlowEndpoint {
            calls: AtomicU32::new(0),
            fail: false,
        });
        let h = harness(ArcEndpoint(Arc::clone(&endpoint)));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let manager = h.manager.clone();
            handles.push(tokio::spawn(async move {
                manager.get_valid_token(&CancellationToken::new()).await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().value(), "token-1");
        }
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_the_same_failure() {
        let endpoint = Arc::new(SlowEndpoint {
            calls: AtomicU32::new(0),
            fail: true,
        });
        let h = harness(ArcEndpoint(Arc::clone(&endpoint)));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let manager = h.manager.clone();
            handles.push(tokio::spawn(async move {
                manager.refresh_token(&CancellationToken::new()).await
            }));
        }

        for handle in handles {
            assert!(matches!(
                handle.await.unwrap(),
                Err(AuthError::Rejected { ref code, .. }) if code == "8005"
            ));
        }
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_caller_does_not_abort_shared_refresh() {
        let endpoint = Arc::new(SlowEndpoint {
            calls: AtomicU32::new(0),
            fail: false,
        });
        let h = harness(ArcEndpoint(Arc::clone(&endpoint)));

        let impatient = CancellationToken::new();
        let patient = CancellationToken::new();

        let (cancelled, completed, ()) = tokio::join!(
            h.manager.get_valid_token(&impatient),
            h.manager.get_valid_token(&patient),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                impatient.cancel();
            },
        );

        assert_eq!(cancelled.unwrap_err(), AuthError::Cancelled);
        assert_eq!(completed.unwrap().value(), "token-1");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn status_is_missing_before_first_use() {
        let h = harness(MockAuthEndpoint::new());
        assert_eq!(h.manager.check_status(), TokenStatus::missing());
    }

    /// In-memory store whose reads and deletes take a while to land.
    #[derive(Default)]
    struct SlowStore {
        inner: InMemoryStore,
        get_delay: Duration,
        delete_delay: Duration,
    }

    #[async_trait]
    impl KeyValueStore for SlowStore {
        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
            self.inner.set(key, value, ttl).await
        }

        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            tokio::time::sleep(self.get_delay).await;
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> Result<bool, StoreError> {
            tokio::time::sleep(self.delete_delay).await;
            self.inner.delete(key).await
        }

        async fn exists(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.exists(key).await
        }

        async fn publish(&self, channel: &str, message: &str) -> Result<u64, StoreError> {
            self.inner.publish(channel, message).await
        }

        async fn h_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
            self.inner.h_set(key, field, value).await
        }
    }

    fn slow_store_manager(endpoint: Arc<SlowEndpoint>, store: Arc<SlowStore>) -> TokenManager {
        TokenManager::new(
            Arc::new(ArcEndpoint(endpoint)),
            store,
            Arc::new(ManualClock::new(start_time())),
            RateLimiter::shared(1_000.0).unwrap(),
            TokenManagerConfig {
                retry: quick_retry(),
                ..TokenManagerConfig::default()
            },
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn invalidated_token_is_not_reloaded_while_delete_is_pending() {
        let endpoint = Arc::new(SlowEndpoint {
            calls: AtomicU32::new(0),
            fail: false,
        });
        let store = Arc::new(SlowStore {
            delete_delay: Duration::from_millis(50),
            ..SlowStore::default()
        });
        let manager = slow_store_manager(Arc::clone(&endpoint), Arc::clone(&store));
        let cancel = CancellationToken::new();

        let rejected = manager.get_valid_token(&cancel).await.unwrap();
        assert_eq!(rejected.value(), "token-1");

        let (invalidated, concurrent) = tokio::join!(
            manager.invalidate_if_current(rejected.value()),
            manager.get_valid_token(&cancel),
        );
        assert!(invalidated);
        assert_eq!(concurrent.unwrap().value(), "token-2");

        let retry = manager.get_valid_token(&cancel).await.unwrap();
        assert_eq!(retry.value(), "token-2");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn refresh_joining_a_store_read_still_issues_a_token() {
        let endpoint = Arc::new(SlowEndpoint {
            calls: AtomicU32::new(0),
            fail: false,
        });
        let store = Arc::new(SlowStore {
            get_delay: Duration::from_millis(50),
            ..SlowStore::default()
        });
        store
            .set(
                TOKEN_STORE_KEY,
                &serde_json::to_string(&day_token("persisted", start_time())).unwrap(),
                None,
            )
            .await
            .unwrap();
        let manager = slow_store_manager(Arc::clone(&endpoint), store);
        let cancel = CancellationToken::new();

        let (loaded, refreshed) = tokio::join!(manager.get_valid_token(&cancel), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            manager.refresh_token(&cancel).await
        });

        assert_eq!(loaded.unwrap().value(), "persisted");
        assert_eq!(refreshed.unwrap().value(), "token-1");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            manager.get_valid_token(&cancel).await.unwrap().value(),
            "token-1"
        );
    }

    /// Lets a test keep a handle on an endpoint shared with the manager.
    struct ArcEndpoint(Arc<SlowEndpoint>);

    #[async_trait]
    impl AuthEndpoint for ArcEndpoint {
        async fn issue_token(&self) -> Result<Token, AuthError> {
            self.0.issue_token().await
        }
    }
}
