//! API Client Integration Tests
//!
//! Drives `KiwoomClient` and `KiwoomAuthClient` against a mock HTTP server:
//! pagination, 401 recovery, retries and endpoint routing.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use kiwoom_gateway::application::ports::{AuthEndpoint, AuthError, SystemClock};
use kiwoom_gateway::infrastructure::config::Credentials;
use kiwoom_gateway::infrastructure::kiwoom::{
    ApiError, ApiRequest, EndpointRegistry, ErrorKind, KiwoomAuthClient, KiwoomClient,
    KiwoomClientConfig, PaginationLimits, StopReason, parse_expires_dt,
};
use kiwoom_gateway::infrastructure::store::InMemoryStore;
use kiwoom_gateway::{RateLimiter, RetryPolicy, TokenManager, TokenManagerConfig};

const STOCK_LIST: &str = "/api/dostk/stkinfo";

// =============================================================================
// Fixtures
// =============================================================================

/// Issues `tok-1`, `tok-2`, ... on successive calls.
#[derive(Default)]
struct TokenSequence {
    issued: AtomicUsize,
}

impl Respond for TokenSequence {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        ResponseTemplate::new(200).set_body_json(json!({
            "token": format!("tok-{n}"),
            "token_type": "bearer",
            "expires_in": 86_400,
            "return_code": 0,
            "return_msg": "ok"
        }))
    }
}

/// Always has more data, with a fresh key per page.
#[derive(Default)]
struct EndlessPages {
    served: AtomicUsize,
}

impl Respond for EndlessPages {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.served.fetch_add(1, Ordering::SeqCst) + 1;
        ResponseTemplate::new(200)
            .insert_header("cont-yn", "Y")
            .insert_header("next-key", format!("K{n}").as_str())
            .set_body_json(json!({"return_code": 0, "page": n}))
    }
}

/// Wraps a responder and records when each request arrived.
struct Timed<R> {
    inner: R,
    arrivals: Arc<Mutex<Vec<Instant>>>,
}

impl<R: Respond> Respond for Timed<R> {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.arrivals.lock().push(Instant::now());
        self.inner.respond(request)
    }
}

fn credentials() -> Credentials {
    Credentials::new("app".to_string(), "secret".to_string())
}

fn quick_retry() -> RetryPolicy {
    RetryPolicy::new(
        "test",
        3,
        Duration::from_millis(10),
        2.0,
        Duration::from_millis(20),
    )
}

async fn mount_token_endpoint(server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(TokenSequence::default())
        .expect(expected_calls)
        .mount(server)
        .await;
}

fn client_with(server: &MockServer, registry: EndpointRegistry, limits: PaginationLimits) -> KiwoomClient {
    build_client(server, registry, limits, 1_000.0, quick_retry())
}

fn build_client(
    server: &MockServer,
    registry: EndpointRegistry,
    limits: PaginationLimits,
    rate_per_sec: f64,
    retry: RetryPolicy,
) -> KiwoomClient {
    let clock = Arc::new(SystemClock);
    let limiter = RateLimiter::shared(rate_per_sec).unwrap();
    let auth = KiwoomAuthClient::new(
        &server.uri(),
        credentials(),
        Duration::from_secs(5),
        clock.clone(),
    )
    .unwrap();

    let tokens = TokenManager::new(
        Arc::new(auth),
        Arc::new(InMemoryStore::new()),
        clock,
        Arc::clone(&limiter),
        TokenManagerConfig::default(),
        CancellationToken::new(),
    );

    KiwoomClient::new(
        KiwoomClientConfig {
            base_url: server.uri(),
            timeout: Duration::from_secs(5),
            retry,
            pagination: limits,
        },
        credentials(),
        registry,
        tokens,
        limiter,
    )
    .unwrap()
}

fn client(server: &MockServer) -> KiwoomClient {
    client_with(server, EndpointRegistry::default(), PaginationLimits::default())
}

// =============================================================================
// Single Calls
// =============================================================================

#[tokio::test]
async fn call_sends_kiwoom_headers() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(STOCK_LIST))
        .and(header("authorization", "Bearer tok-1"))
        .and(header("appkey", "app"))
        .and(header("appsecret", "secret"))
        .and(header("api-id", "ka10099"))
        .and(header("cont-yn", "N"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "return_code": 0,
            "list": [{"code": "005930"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = client(&server)
        .call(
            &ApiRequest::post("ka10099", json!({"mrkt_tp": "0"})),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body["list"][0]["code"], "005930");
    assert!(!response.cursor.has_next());
}

#[tokio::test]
async fn unknown_endpoint_makes_no_request() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server, 0).await;

    let result = client_with(&server, EndpointRegistry::empty(), PaginationLimits::default())
        .call(&ApiRequest::get("ka99999"), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(ApiError::Configuration(_))), "{result:?}");
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn transient_server_errors_are_retried() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(STOCK_LIST))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(STOCK_LIST))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"return_code": 0})))
        .expect(1)
        .mount(&server)
        .await;

    let result = client(&server)
        .call(&ApiRequest::post("ka10099", json!({})), &CancellationToken::new())
        .await;

    assert!(result.is_ok(), "{result:?}");
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(STOCK_LIST))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .expect(1)
        .mount(&server)
        .await;

    let result = client(&server)
        .call(&ApiRequest::post("ka10099", json!({})), &CancellationToken::new())
        .await;

    assert!(
        matches!(result, Err(ApiError::Rejected { status: 400, .. })),
        "{result:?}"
    );
}

#[tokio::test]
async fn non_zero_return_code_is_rejected() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(STOCK_LIST))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "return_code": 3,
            "return_msg": "invalid market type"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let result = client(&server)
        .call(&ApiRequest::post("ka10099", json!({})), &CancellationToken::new())
        .await;

    match result {
        Err(ApiError::Rejected { status, message }) => {
            assert_eq!(status, 3);
            assert_eq!(message, "invalid market type");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

// =============================================================================
// Rate Limiting and Cancellation
// =============================================================================

#[tokio::test]
async fn token_refresh_and_request_are_spaced_by_the_limiter() {
    let server = MockServer::start().await;
    let arrivals = Arc::new(Mutex::new(Vec::new()));

    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(Timed {
            inner: TokenSequence::default(),
            arrivals: Arc::clone(&arrivals),
        })
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(STOCK_LIST))
        .respond_with(Timed {
            inner: ResponseTemplate::new(200).set_body_json(json!({"return_code": 0})),
            arrivals: Arc::clone(&arrivals),
        })
        .expect(1)
        .mount(&server)
        .await;

    // 4 permits per second: 250ms between grants.
    let client = build_client(
        &server,
        EndpointRegistry::default(),
        PaginationLimits::default(),
        4.0,
        quick_retry(),
    );
    client
        .call(&ApiRequest::post("ka10099", json!({})), &CancellationToken::new())
        .await
        .unwrap();

    let arrivals = arrivals.lock();
    assert_eq!(arrivals.len(), 2);
    let gap = arrivals[1].duration_since(arrivals[0]);
    assert!(gap >= Duration::from_millis(200), "auth and request only {gap:?} apart");
}

#[tokio::test]
async fn cancel_during_rate_limit_wait_is_cancellation() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server, 1).await;
    Mock::given(method("POST"))
        .and(path(STOCK_LIST))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"return_code": 0})))
        .expect(0)
        .mount(&server)
        .await;

    // The token refresh takes the only permit; the request then waits 10s.
    let client = build_client(
        &server,
        EndpointRegistry::default(),
        PaginationLimits::default(),
        0.1,
        quick_retry(),
    );
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let err = client
        .call(&ApiRequest::post("ka10099", json!({})), &cancel)
        .await
        .unwrap_err();

    assert_eq!(err, ApiError::Cancelled);
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn cancel_during_backoff_is_cancellation() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server, 1).await;
    Mock::given(method("POST"))
        .and(path(STOCK_LIST))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let client = build_client(
        &server,
        EndpointRegistry::default(),
        PaginationLimits::default(),
        1_000.0,
        RetryPolicy::conservative(),
    );
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let err = client
        .call(&ApiRequest::post("ka10099", json!({})), &cancel)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(2));
}

// =============================================================================
// 401 Recovery
// =============================================================================

#[tokio::test]
async fn unauthorized_reissues_token_and_retries_once() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server, 2).await;

    Mock::given(method("POST"))
        .and(path(STOCK_LIST))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(STOCK_LIST))
        .and(header("authorization", "Bearer tok-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"return_code": 0})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let result = client
        .call(&ApiRequest::post("ka10099", json!({})), &CancellationToken::new())
        .await;

    assert!(result.is_ok(), "{result:?}");
    let status = client.tokens().check_status();
    assert!(status.exists && status.valid);
}

#[tokio::test]
async fn persistent_unauthorized_is_not_looped() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server, 2).await;

    Mock::given(method("POST"))
        .and(path(STOCK_LIST))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;

    let result = client(&server)
        .call(&ApiRequest::post("ka10099", json!({})), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(ApiError::AuthExpired)), "{result:?}");
}

// =============================================================================
// Pagination
// =============================================================================

/// Pages 1..=3 chained by keys `K1` and `K2`; each key is matched once.
async fn mount_three_pages(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(STOCK_LIST))
        .and(header("cont-yn", "N"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("cont-yn", "Y")
                .insert_header("next-key", "K1")
                .set_body_json(json!({"return_code": 0, "page": 1})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(STOCK_LIST))
        .and(header("cont-yn", "Y"))
        .and(header("next-key", "K1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("cont-yn", "Y")
                .insert_header("next-key", "K2")
                .set_body_json(json!({"return_code": 0, "page": 2})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(STOCK_LIST))
        .and(header("cont-yn", "Y"))
        .and(header("next-key", "K2"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("cont-yn", "N")
                .set_body_json(json!({"return_code": 0, "page": 3})),
        )
        .expect(1)
        .mount(&server)
        .await;
}

#[tokio::test]
async fn paginated_call_walks_continuation_keys() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server, 1).await;

    mount_three_pages(&server).await;

    let mut pages = client(&server)
        .call_paginated(ApiRequest::post("ka10099", json!({})), CancellationToken::new());

    let mut seen = Vec::new();
    while let Some(page) = pages.next_page().await {
        seen.push(page.unwrap().body["page"].as_i64().unwrap());
    }

    assert_eq!(seen, vec![1, 2, 3]);
    assert_eq!(pages.pages_fetched(), 3);
    assert_eq!(pages.stop_reason(), Some(StopReason::Exhausted));
}

#[tokio::test]
async fn paginated_stream_yields_pages_in_order() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server, 1).await;
    mount_three_pages(&server).await;

    let pages: Vec<_> = client(&server)
        .call_paginated(ApiRequest::post("ka10099", json!({})), CancellationToken::new())
        .into_stream()
        .map(|page| page.unwrap().body["page"].as_i64().unwrap())
        .collect()
        .await;

    assert_eq!(pages, vec![1, 2, 3]);
}

#[tokio::test]
async fn paginator_is_lazy() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server, 0).await;

    let pages = client(&server)
        .call_paginated(ApiRequest::post("ka10099", json!({})), CancellationToken::new());
    drop(pages);

    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn repeated_continuation_key_stops_pagination() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(STOCK_LIST))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("cont-yn", "Y")
                .insert_header("next-key", "SAME")
                .set_body_json(json!({"return_code": 0})),
        )
        .expect(2)
        .mount(&server)
        .await;

    let mut pages = client(&server)
        .call_paginated(ApiRequest::post("ka10099", json!({})), CancellationToken::new());
    while let Some(page) = pages.next_page().await {
        page.unwrap();
    }

    assert_eq!(pages.pages_fetched(), 2);
    assert_eq!(pages.stop_reason(), Some(StopReason::RepeatedKey));
}

#[tokio::test]
async fn page_limit_bounds_endless_pagination() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(STOCK_LIST))
        .respond_with(EndlessPages::default())
        .expect(4)
        .mount(&server)
        .await;

    let limits = PaginationLimits {
        max_pages: 4,
        max_duration: Duration::from_secs(60),
    };
    let mut pages = client_with(&server, EndpointRegistry::default(), limits)
        .call_paginated(ApiRequest::post("ka10099", json!({})), CancellationToken::new());
    while let Some(page) = pages.next_page().await {
        page.unwrap();
    }

    assert_eq!(pages.pages_fetched(), 4);
    assert_eq!(pages.stop_reason(), Some(StopReason::MaxPages));
}

#[tokio::test]
async fn page_error_ends_pagination() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(STOCK_LIST))
        .and(header("cont-yn", "N"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("cont-yn", "Y")
                .insert_header("next-key", "K1")
                .set_body_json(json!({"return_code": 0})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(STOCK_LIST))
        .and(header("next-key", "K1"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let result = client(&server)
        .call_paginated(ApiRequest::post("ka10099", json!({})), CancellationToken::new())
        .collect_all()
        .await;

    assert!(
        matches!(result, Err(ApiError::Rejected { status: 404, .. })),
        "{result:?}"
    );
}

// =============================================================================
// Auth Client
// =============================================================================

fn auth_client(server: &MockServer) -> KiwoomAuthClient {
    KiwoomAuthClient::new(
        &server.uri(),
        credentials(),
        Duration::from_secs(5),
        Arc::new(SystemClock),
    )
    .unwrap()
}

#[tokio::test]
async fn auth_client_posts_client_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(body_json(json!({
            "grant_type": "client_credentials",
            "appkey": "app",
            "secretkey": "secret"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "expires_dt": "20991231235959",
            "token_type": "bearer",
            "token": "issued",
            "return_code": 0,
            "return_msg": "ok"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let token = auth_client(&server).issue_token().await.unwrap();

    assert_eq!(token.value(), "issued");
    assert_eq!(token.expires_at(), parse_expires_dt("20991231235959").unwrap());
}

#[tokio::test]
async fn auth_client_classifies_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "return_code": 8005,
            "return_msg": "invalid appkey"
        })))
        .mount(&server)
        .await;

    let client = auth_client(&server);

    let first = client.issue_token().await;
    assert!(matches!(first, Err(AuthError::Unreachable(_))), "{first:?}");

    match client.issue_token().await {
        Err(AuthError::Rejected { code, message }) => {
            assert_eq!(code, "8005");
            assert_eq!(message, "invalid appkey");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}
