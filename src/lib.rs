// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod analysis;
pub mod api;
pub mod config;
pub mod fetch;
pub mod metrics;
pub mod news;
pub mod pipeline;
pub mod record;
pub mod scheduler;
pub mod stage;
pub mod store;
pub mod summary;

// ---- Re-exports for stable public API ----
pub use crate::analysis::{AnalysisClient, AnalysisError, OpenAiProvider, Provider, RetryPolicy};
pub use crate::api::create_router as router;
pub use crate::config::PipelineConfig;
pub use crate::news::NewsItem;
pub use crate::pipeline::{PipelineManager, PipelineSettings};
pub use crate::record::{CompositeRecord, RecordStatus};
pub use crate::scheduler::{BatchError, BatchReport, Scheduler};
pub use crate::store::{EventStore, RecordFilter, SqliteEventStore};

use std::sync::Arc;
use std::time::Duration;

/// Analysis client for the configured model endpoint.
pub fn build_client(cfg: &PipelineConfig) -> anyhow::Result<Arc<AnalysisClient>> {
    crate::metrics::ensure_described();
    let provider = Arc::new(OpenAiProvider::from_config(&cfg.model)?);
    let client = AnalysisClient::new(provider, RetryPolicy::from(&cfg.retry))
        .with_call_timeout(Duration::from_secs(cfg.model.timeout_secs))
        .with_memo(cfg.memoize_responses);
    Ok(Arc::new(client))
}

/// Pipeline with the HTTP content fetcher attached.
pub fn build_pipeline(
    cfg: &PipelineConfig,
    client: Arc<AnalysisClient>,
    store: Arc<dyn EventStore>,
) -> anyhow::Result<Arc<PipelineManager>> {
    let fetcher = fetch::HttpFetcher::new(Duration::from_secs(cfg.fetch_timeout_secs))?;
    Ok(Arc::new(
        PipelineManager::new(client, store, PipelineSettings::from(cfg)).with_fetcher(Arc::new(fetcher)),
    ))
}
