//! Prometheus Metrics Module
//!
//! Exposes gateway metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **API**: Request outcomes and retries per endpoint id
//! - **Auth**: Token refresh outcomes
//! - **Rate limiting**: Time spent waiting for permits
//! - **Streaming**: Frames received by kind, connection state
//! - **Ingestion**: Per-tick latency and stage failures
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before `init_metrics` is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Calling it again returns the handle installed by the first call.
///
/// # Errors
///
/// Returns `BuildError` if the global recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    let handle = PROMETHEUS_HANDLE.get_or_init(|| handle).clone();
    register_metrics();
    Ok(handle)
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "kiwoom_api_requests_total",
        "Brokerage API calls by endpoint id and outcome"
    );
    describe_counter!(
        "kiwoom_api_retries_total",
        "Brokerage API attempts that were retried"
    );
    describe_counter!(
        "kiwoom_token_refreshes_total",
        "Access token refreshes by outcome"
    );
    describe_counter!(
        "kiwoom_stream_frames_total",
        "WebSocket frames received by kind"
    );
    describe_counter!(
        "kiwoom_ingestion_stage_failures_total",
        "Ingestion stage failures by stage"
    );

    describe_histogram!(
        "kiwoom_rate_limit_wait_seconds",
        "Time spent waiting for a rate limit permit"
    );
    describe_histogram!(
        "kiwoom_ingestion_tick_seconds",
        "Time to run all ingestion stages for one tick"
    );

    describe_gauge!(
        "kiwoom_stream_connected",
        "Whether the price stream is connected (1) or not (0)"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Outcome label for API calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// 2xx with a zero return code.
    Success,
    /// Failed after retries or with a fatal error.
    Failure,
    /// Caller cancelled.
    Cancelled,
}

impl CallOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Frame kind label for the price stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Frame carrying at least one price tick.
    Price,
    /// Subscription acknowledgements and other control messages.
    Control,
    /// Frame that could not be decoded.
    Invalid,
}

impl FrameKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::Control => "control",
            Self::Invalid => "invalid",
        }
    }
}

/// Record the final outcome of an API call.
pub fn record_api_request(endpoint_id: &str, outcome: CallOutcome) {
    counter!(
        "kiwoom_api_requests_total",
        "endpoint" => endpoint_id.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record an API attempt that is about to be retried.
pub fn record_api_retry(endpoint_id: &str) {
    counter!(
        "kiwoom_api_retries_total",
        "endpoint" => endpoint_id.to_string()
    )
    .increment(1);
}

/// Record a token refresh.
pub fn record_token_refresh(success: bool) {
    counter!(
        "kiwoom_token_refreshes_total",
        "outcome" => if success { "success" } else { "failure" }
    )
    .increment(1);
}

/// Record the time a caller waited for a rate limit permit.
pub fn record_rate_limit_wait(waited: Duration) {
    histogram!("kiwoom_rate_limit_wait_seconds").record(waited.as_secs_f64());
}

/// Record a frame received on the price stream.
pub fn record_stream_frame(kind: FrameKind) {
    counter!(
        "kiwoom_stream_frames_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Update the stream connection gauge.
pub fn set_stream_connected(connected: bool) {
    gauge!("kiwoom_stream_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Record a failed ingestion stage.
pub fn record_ingestion_stage_failure(stage: &'static str) {
    counter!(
        "kiwoom_ingestion_stage_failures_total",
        "stage" => stage
    )
    .increment(1);
}

/// Record the time to ingest one tick.
pub fn record_ingestion_tick(duration: Duration) {
    histogram!("kiwoom_ingestion_tick_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
