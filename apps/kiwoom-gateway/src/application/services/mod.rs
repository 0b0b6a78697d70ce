//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `TokenManager`: Access token cache, persistence and refresh
//! - `SingleFlight`: Per-key coalescing of concurrent operations
//! - `IngestionPipeline`: Fans price ticks into the store

mod ingestion;
mod single_flight;
mod token_lifecycle;

pub use ingestion::{
    CACHE_KEY_PREFIX, CHANNEL_PREFIX, DEFAULT_BATCH_KEY, IngestionConfig, IngestionPipeline,
    PipelineStats, PipelineStatsSnapshot, Stage, StageReport,
};
pub use single_flight::SingleFlight;
pub use token_lifecycle::{TOKEN_STORE_KEY, TokenManager, TokenManagerConfig};
