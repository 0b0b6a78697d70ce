//! Price Ingestion Pipeline
//!
//! Fans every streamed tick through three store stages:
//!
//! 1. **Cache**: `realtime:price:{code}` with a short TTL
//! 2. **Publish**: `stock:price:{code}` for live subscribers
//! 3. **Batch**: field `{code}:{timestamp}` in the aggregation hash
//!
//! A failing stage is logged and counted but never stops the stages after
//! it, and never stops the next tick. Ticks are processed concurrently up to
//! a configurable bound.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{SharedStore, StoreError};
use crate::domain::market::PriceTick;
use crate::infrastructure::metrics;

/// Prefix of the short-lived per-stock price cache key.
pub const CACHE_KEY_PREFIX: &str = "realtime:price:";

/// Prefix of the per-stock publish channel.
pub const CHANNEL_PREFIX: &str = "stock:price:";

/// Default aggregation hash key.
pub const DEFAULT_BATCH_KEY: &str = "batch:queue:price";

// =============================================================================
// Configuration
// =============================================================================

/// Pipeline settings.
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// TTL of the real-time cache entry.
    pub cache_ttl: Duration,
    /// Hash receiving every tick for batch aggregation.
    pub batch_key: String,
    /// Maximum ticks processed at once.
    pub concurrency: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(5),
            batch_key: DEFAULT_BATCH_KEY.to_string(),
            concurrency: 64,
        }
    }
}

// =============================================================================
// Stage Reporting
// =============================================================================

/// Pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Real-time cache write.
    Cache,
    /// Channel publish.
    Publish,
    /// Batch hash append.
    Batch,
}

impl Stage {
    /// Metric and log label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Publish => "publish",
            Self::Batch => "batch",
        }
    }
}

/// Outcome of each stage for one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    /// Cache write result.
    pub cache: Result<(), StoreError>,
    /// Publish result with the receiver count.
    pub publish: Result<u64, StoreError>,
    /// Batch append result.
    pub batch: Result<(), StoreError>,
}

impl StageReport {
    /// Whether every stage succeeded.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.cache.is_ok() && self.publish.is_ok() && self.batch.is_ok()
    }

    /// Failed stages with their errors.
    #[must_use]
    pub fn failures(&self) -> Vec<(Stage, &StoreError)> {
        [
            (Stage::Cache, self.cache.as_ref().err()),
            (Stage::Publish, self.publish.as_ref().err()),
            (Stage::Batch, self.batch.as_ref().err()),
        ]
        .into_iter()
        .filter_map(|(stage, error)| error.map(|e| (stage, e)))
        .collect()
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Running totals, shared across concurrent tick tasks.
#[derive(Debug, Default)]
pub struct PipelineStats {
    ticks_processed: AtomicU64,
    ticks_complete: AtomicU64,
    cache_failures: AtomicU64,
    publish_failures: AtomicU64,
    batch_failures: AtomicU64,
}

/// Point-in-time copy of `PipelineStats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PipelineStatsSnapshot {
    /// Ticks that went through all three stages.
    pub ticks_processed: u64,
    /// Ticks where every stage succeeded.
    pub ticks_complete: u64,
    /// Failed cache writes.
    pub cache_failures: u64,
    /// Failed publishes.
    pub publish_failures: u64,
    /// Failed batch appends.
    pub batch_failures: u64,
}

impl PipelineStats {
    fn record(&self, report: &StageReport) {
        self.ticks_processed.fetch_add(1, Ordering::Relaxed);
        if report.is_complete() {
            self.ticks_complete.fetch_add(1, Ordering::Relaxed);
        }
        for (stage, _) in report.failures() {
            let counter = match stage {
                Stage::Cache => &self.cache_failures,
                Stage::Publish => &self.publish_failures,
                Stage::Batch => &self.batch_failures,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Current totals.
    #[must_use]
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            ticks_processed: self.ticks_processed.load(Ordering::Relaxed),
            ticks_complete: self.ticks_complete.load(Ordering::Relaxed),
            cache_failures: self.cache_failures.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            batch_failures: self.batch_failures.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Three-stage tick ingestion. Cheap to clone.
#[derive(Clone)]
pub struct IngestionPipeline {
    store: SharedStore,
    config: Arc<IngestionConfig>,
    stats: Arc<PipelineStats>,
}

impl IngestionPipeline {
    /// Create a pipeline writing to `store`.
    #[must_use]
    pub fn new(store: SharedStore, config: IngestionConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            stats: Arc::new(PipelineStats::default()),
        }
    }

    /// Shared running totals.
    #[must_use]
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Run all three stages for `tick`.
    pub async fn process(&self, tick: &PriceTick) -> StageReport {
        let started = Instant::now();

        let report = StageReport {
            cache: self.cache_stage(tick).await,
            publish: self.publish_stage(tick).await,
            batch: self.batch_stage(tick).await,
        };

        for (stage, error) in report.failures() {
            metrics::record_ingestion_stage_failure(stage.as_str());
            tracing::warn!(
                stock_code = %tick.stock_code(),
                timestamp = tick.timestamp_millis(),
                stage = stage.as_str(),
                error = %error,
                "Ingestion stage failed"
            );
        }

        self.stats.record(&report);
        metrics::record_ingestion_tick(started.elapsed());
        tracing::debug!(
            stock_code = %tick.stock_code(),
            complete = report.is_complete(),
            "Tick ingested"
        );
        report
    }

    /// Consume ticks until the channel closes or `cancel` fires, then wait
    /// for ticks already in progress.
    pub async fn run(&self, mut ticks: mpsc::Receiver<PriceTick>, cancel: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        tracing::info!(
            concurrency = self.config.concurrency,
            batch_key = %self.config.batch_key,
            "Ingestion pipeline started"
        );

        loop {
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let tick = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                tick = ticks.recv() => match tick {
                    Some(tick) => tick,
                    None => break,
                },
            };

            let pipeline = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                pipeline.process(&tick).await;
            });

            while let Some(joined) = tasks.try_join_next() {
                log_join_error(joined);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            log_join_error(joined);
        }

        let stats = self.stats.snapshot();
        tracing::info!(
            ticks_processed = stats.ticks_processed,
            ticks_complete = stats.ticks_complete,
            "Ingestion pipeline stopped"
        );
    }

    async fn cache_stage(&self, tick: &PriceTick) -> Result<(), StoreError> {
        let payload = encode(tick)?;
        let key = format!("{CACHE_KEY_PREFIX}{}", tick.stock_code());
        self.store
            .set(&key, &payload, Some(self.config.cache_ttl))
            .await
    }

    async fn publish_stage(&self, tick: &PriceTick) -> Result<u64, StoreError> {
        let payload = encode(&tick.to_event())?;
        let channel = format!("{CHANNEL_PREFIX}{}", tick.stock_code());
        self.store.publish(&channel, &payload).await
    }

    async fn batch_stage(&self, tick: &PriceTick) -> Result<(), StoreError> {
        let payload = encode(tick)?;
        let field = format!("{}:{}", tick.stock_code(), tick.timestamp_millis());
        self.store
            .h_set(&self.config.batch_key, &field, &payload)
            .await
    }
}

impl std::fmt::Debug for IngestionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionPipeline")
            .field("config", &self.config)
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "Ingestion task failed");
    }
}

// =============================================================================
// Tests
// =============================================================================
