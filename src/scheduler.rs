// src/scheduler.rs
//! Bounded worker pool: one pipeline run per item, at most `workers` at once.
//!
//! Runs are independent. A failing or panicking run becomes a `failed` record and never
//! touches its siblings. The only run-level fault is a store that stops answering.

use metrics::gauge;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::news::NewsItem;
use crate::pipeline::{PipelineError, PipelineManager};
use crate::record::{CompositeRecord, RecordStatus};
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItem {
    pub news_id: String,
    pub error: String,
}

/// Full accounting of one batch: every input id lands in exactly one list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub complete: Vec<String>,
    pub partial: Vec<String>,
    pub failed: Vec<FailedItem>,
    /// Never dispatched (deadline reached or store lost). Not an error.
    pub unprocessed: Vec<String>,
    pub elapsed_ms: u64,
}

impl BatchReport {
    pub fn processed(&self) -> usize {
        self.complete.len() + self.partial.len() + self.failed.len()
    }

    pub fn is_fully_accounted(&self) -> bool {
        self.processed() + self.unprocessed.len() == self.total
    }

    fn push_record(&mut self, record: CompositeRecord) {
        match record.status {
            RecordStatus::Complete => self.complete.push(record.news_id),
            RecordStatus::Partial => self.partial.push(record.news_id),
            RecordStatus::Failed | RecordStatus::InFlight => self.failed.push(FailedItem {
                news_id: record.news_id,
                error: record.error.unwrap_or_else(|| "run ended without a final status".into()),
            }),
        }
    }

    fn sort(&mut self) {
        self.complete.sort();
        self.partial.sort();
        self.failed.sort_by(|a, b| a.news_id.cmp(&b.news_id));
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    /// The store stopped answering. Items already running were finished; the rest were
    /// left unprocessed. The partial report is attached.
    #[error("event store unavailable: {source}")]
    StoreUnavailable {
        #[source]
        source: StoreError,
        report: Box<BatchReport>,
    },
}

type RunOutput = Result<CompositeRecord, PipelineError>;

pub struct Scheduler {
    pipeline: Arc<PipelineManager>,
    workers: usize,
    deadline: Option<Duration>,
}

impl Scheduler {
    pub fn new(pipeline: Arc<PipelineManager>, workers: usize) -> Self {
        Self {
            pipeline,
            workers: workers.max(1),
            deadline: None,
        }
    }

    pub fn from_config(pipeline: Arc<PipelineManager>, cfg: &PipelineConfig) -> Self {
        let mut s = Self::new(pipeline, cfg.effective_workers());
        s.deadline = cfg.deadline_secs.map(Duration::from_secs);
        s
    }

    /// Stop dispatching new items once `deadline` has elapsed since the batch started.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub async fn run_batch(&self, items: Vec<NewsItem>) -> Result<BatchReport, BatchError> {
        let started = Instant::now();
        let deadline = self.deadline.map(|d| tokio::time::Instant::now() + d);
        let mut report = BatchReport {
            total: items.len(),
            ..BatchReport::default()
        };

        if let Err(source) = self.pipeline.store().ping().await {
            error!(error = %source, "event store unreachable; batch not started");
            report.unprocessed = items.into_iter().map(|i| i.id).collect();
            return Err(BatchError::StoreUnavailable {
                source,
                report: Box::new(report),
            });
        }

        info!(items = report.total, workers = self.workers, "batch started");
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks: JoinSet<RunOutput> = JoinSet::new();
        let mut in_flight: HashMap<Id, NewsItem> = HashMap::new();
        let mut store_down: Option<StoreError> = None;
        let mut queue = items.into_iter();

        while let Some(item) = queue.next() {
            let permit = match deadline {
                Some(at) => match tokio::time::timeout_at(at, semaphore.clone().acquire_owned()).await {
                    Ok(p) => p.ok(),
                    Err(_) => None,
                },
                None => semaphore.clone().acquire_owned().await.ok(),
            };

            while let Some(done) = tasks.try_join_next_with_id() {
                self.settle(done, &mut in_flight, &mut report, &mut store_down).await;
            }

            let expired = deadline.is_some_and(|at| tokio::time::Instant::now() >= at);
            let Some(permit) = permit.filter(|_| store_down.is_none() && !expired) else {
                if expired {
                    warn!(remaining = queue.len() + 1, "batch deadline reached; leaving items unprocessed");
                }
                report.unprocessed.push(item.id);
                report.unprocessed.extend(queue.by_ref().map(|i| i.id));
                break;
            };

            let pipeline = self.pipeline.clone();
            let task_item = item.clone();
            let handle = tasks.spawn(async move {
                let _permit = permit;
                pipeline.run(&task_item).await
            });
            in_flight.insert(handle.id(), item);
        }

        while let Some(done) = tasks.join_next_with_id().await {
            self.settle(done, &mut in_flight, &mut report, &mut store_down).await;
        }

        report.sort();
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        gauge!("scheduler_batch_last_run_ts").set(chrono::Utc::now().timestamp() as f64);
        info!(
            total = report.total,
            complete = report.complete.len(),
            partial = report.partial.len(),
            failed = report.failed.len(),
            unprocessed = report.unprocessed.len(),
            elapsed_ms = report.elapsed_ms,
            "batch finished"
        );

        match store_down {
            Some(source) => Err(BatchError::StoreUnavailable {
                source,
                report: Box::new(report),
            }),
            None => Ok(report),
        }
    }

    async fn settle(
        &self,
        done: Result<(Id, RunOutput), JoinError>,
        in_flight: &mut HashMap<Id, NewsItem>,
        report: &mut BatchReport,
        store_down: &mut Option<StoreError>,
    ) {
        match done {
            Ok((id, Ok(record))) => {
                in_flight.remove(&id);
                report.push_record(record);
            }
            Ok((id, Err(err))) => {
                let item = in_flight.remove(&id);
                warn!(error = %err, "pipeline run could not persist its record");
                let PipelineError::Persistence { news_id, .. } = &err;
                report.failed.push(FailedItem {
                    news_id: news_id.clone(),
                    error: err.to_string(),
                });
                if let Some(item) = item {
                    self.salvage(&item, &err.to_string(), store_down).await;
                }
            }
            Err(join_err) => {
                let reason = if join_err.is_panic() {
                    "pipeline run panicked"
                } else {
                    "pipeline run was cancelled"
                };
                let Some(item) = in_flight.remove(&join_err.id()) else {
                    error!(reason, "lost track of a pipeline task");
                    return;
                };
                warn!(news_id = %item.id, reason, "pipeline run aborted");
                report.failed.push(FailedItem {
                    news_id: item.id.clone(),
                    error: reason.to_string(),
                });
                self.salvage(&item, reason, store_down).await;
            }
        }
    }

    /// After an abnormal end: check the store is still there, then write the failure.
    async fn salvage(&self, item: &NewsItem, reason: &str, store_down: &mut Option<StoreError>) {
        if store_down.is_some() {
            return;
        }
        if let Err(e) = self.pipeline.store().ping().await {
            error!(error = %e, "event store stopped answering; no further items will be dispatched");
            *store_down = Some(e);
            return;
        }
        if let Err(e) = self.pipeline.record_failure(item, reason).await {
            warn!(news_id = %item.id, error = %e, "could not record failed run");
        }
    }
}
