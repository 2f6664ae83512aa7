// src/pipeline.rs
//! PipelineManager: drives one item through the stages and keeps its record current.
//!
//! ```text
//! Started --classify ok--> Classified --gate fails--> ShortCircuited --> Finalized(partial)
//!                                     --gate passes-> DeepAnalysisRunning --> Finalized(complete)
//! any terminal stage error ---------------------------------------------> Finalized(failed)
//! ```
//!
//! The record is upserted after every completed stage, so a failure never discards
//! results that were already computed.

use chrono::Utc;
use metrics::{counter, histogram};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::analysis::AnalysisClient;
use crate::config::PipelineConfig;
use crate::fetch::{resolve_content, ContentFetcher};
use crate::news::NewsItem;
use crate::record::{CompositeRecord, RecordStatus};
use crate::stage::{SimilarEvent, StageKind};
use crate::store::{EventStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Started,
    Classified,
    ShortCircuited,
    DeepAnalysisRunning,
    Finalized(RecordStatus),
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Started => f.write_str("started"),
            PipelineState::Classified => f.write_str("classified"),
            PipelineState::ShortCircuited => f.write_str("short_circuited"),
            PipelineState::DeepAnalysisRunning => f.write_str("deep_analysis_running"),
            PipelineState::Finalized(s) => write!(f, "finalized({s})"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The record could not be written; terminal for this item.
    #[error("persisting {news_id}: {source}")]
    Persistence {
        news_id: String,
        #[source]
        source: StoreError,
    },
}

/// Knobs the manager reads from `PipelineConfig`.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub classify_confidence_threshold: f64,
    pub max_content_chars: usize,
    pub similar_events_days: u32,
    pub similar_events_limit: usize,
}

impl From<&PipelineConfig> for PipelineSettings {
    fn from(cfg: &PipelineConfig) -> Self {
        Self {
            classify_confidence_threshold: cfg.classify_confidence_threshold,
            max_content_chars: cfg.max_content_chars,
            similar_events_days: cfg.similar_events_days,
            similar_events_limit: cfg.similar_events_limit,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

pub struct PipelineManager {
    client: Arc<AnalysisClient>,
    store: Arc<dyn EventStore>,
    fetcher: Option<Arc<dyn ContentFetcher>>,
    settings: PipelineSettings,
}

impl PipelineManager {
    pub fn new(
        client: Arc<AnalysisClient>,
        store: Arc<dyn EventStore>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            client,
            store,
            fetcher: None,
            settings,
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ContentFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Run every applicable stage for `item` and return the finalized record.
    ///
    /// Stage failures finalize the record as `failed` and still return `Ok`; only a
    /// store write failure surfaces as an error.
    pub async fn run(&self, item: &NewsItem) -> Result<CompositeRecord, PipelineError> {
        let started = Instant::now();
        let mut record = CompositeRecord::in_flight(item, Utc::now());
        // A re-run keeps the first creation time so the returned record matches the stored row.
        if let Some(previous) = self.existing(&item.id).await? {
            record.created_at = previous.created_at;
        }
        self.persist(&record).await?;
        let mut state = PipelineState::Started;
        debug!(news_id = %item.id, state = %state, "pipeline started");

        let content = resolve_content(item, self.fetcher.as_deref(), self.settings.max_content_chars).await;
        let mut session = self.client.session();
        let mut similar: Vec<SimilarEvent> = Vec::new();

        for stage in StageKind::PIPELINE {
            if stage == StageKind::CausalValidate {
                similar = self.lookup_similar(&record).await;
            }

            let t0 = Instant::now();
            let outcome = {
                let ctx = record.stages.context(item, &content.text, &similar);
                stage.run(&mut session, &ctx).await
            };
            histogram!("stage_duration_ms", "stage" => stage.as_str())
                .record(t0.elapsed().as_secs_f64() * 1000.0);

            match outcome {
                Ok(output) => {
                    record.apply(output);
                    record.updated_at = Utc::now();
                    self.persist(&record).await?;
                    debug!(news_id = %item.id, stage = %stage, "stage completed");
                }
                Err(err) => {
                    counter!("stage_failures_total", "stage" => stage.as_str()).increment(1);
                    warn!(news_id = %item.id, stage = %stage, state = %state, error = %err, "stage failed");
                    return self.finish(record, RecordStatus::Failed, Some(err.to_string()), started).await;
                }
            }

            if stage == StageKind::Classify {
                state = PipelineState::Classified;
                let passed = record
                    .stages
                    .classify
                    .as_ref()
                    .is_some_and(|c| c.passes_gate(self.settings.classify_confidence_threshold));
                if !passed {
                    state = PipelineState::ShortCircuited;
                    debug!(news_id = %item.id, state = %state, "gate not passed");
                    return self.finish(record, RecordStatus::Partial, None, started).await;
                }
                state = PipelineState::DeepAnalysisRunning;
                debug!(news_id = %item.id, state = %state, "gate passed");
            }
        }

        self.finish(record, RecordStatus::Complete, None, started).await
    }

    /// Mark a run that ended outside `run` (panic, write failure) as failed, keeping any
    /// stage results already stored for the item.
    pub async fn record_failure(&self, item: &NewsItem, error: &str) -> Result<CompositeRecord, PipelineError> {
        let existing = self.existing(&item.id).await?;
        let mut record = existing.unwrap_or_else(|| CompositeRecord::in_flight(item, Utc::now()));
        record.finalize(RecordStatus::Failed, Some(error.to_string()), Utc::now());
        self.persist(&record).await?;
        counter!("pipeline_runs_total", "status" => RecordStatus::Failed.as_str()).increment(1);
        Ok(record)
    }

    async fn finish(
        &self,
        mut record: CompositeRecord,
        status: RecordStatus,
        error: Option<String>,
        started: Instant,
    ) -> Result<CompositeRecord, PipelineError> {
        record.finalize(status, error, Utc::now());
        self.persist(&record).await?;
        counter!("pipeline_runs_total", "status" => status.as_str()).increment(1);
        info!(
            news_id = %record.news_id,
            state = %PipelineState::Finalized(status),
            stages = ?record.stages.populated(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pipeline finalized"
        );
        Ok(record)
    }

    async fn persist(&self, record: &CompositeRecord) -> Result<(), PipelineError> {
        self.store
            .upsert(record)
            .await
            .map_err(|source| PipelineError::Persistence {
                news_id: record.news_id.clone(),
                source,
            })
    }

    async fn existing(&self, news_id: &str) -> Result<Option<CompositeRecord>, PipelineError> {
        self.store.get(news_id).await.map_err(|source| PipelineError::Persistence {
            news_id: news_id.to_string(),
            source,
        })
    }

    async fn lookup_similar(&self, record: &CompositeRecord) -> Vec<SimilarEvent> {
        match self
            .store
            .similar_events(
                record,
                self.settings.similar_events_days,
                self.settings.similar_events_limit,
            )
            .await
        {
            Ok(events) => events,
            Err(e) => {
                warn!(news_id = %record.news_id, error = %e, "similar event lookup failed; continuing without history");
                Vec::new()
            }
        }
    }
}
