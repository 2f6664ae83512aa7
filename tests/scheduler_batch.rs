// tests/scheduler_batch.rs
//
// Scheduler: bounded fan-out, failure isolation and run-level faults.
//
// Covered:
// - one always-failing item never affects siblings (workers 1 / 3 / 8)
// - a panicking run becomes a failed record
// - concurrent model calls never exceed the worker bound
// - deadline leaves undispatched items unprocessed
// - unreachable store is a run-level error with every item unprocessed
// - store lost mid-batch: failed item, failed re-ping, nothing further dispatched

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use oil_event_analyzer::analysis::ProviderError;
use oil_event_analyzer::record::{CompositeRecord, RecordStatus};
use oil_event_analyzer::stage::StageKind;
use oil_event_analyzer::store::StoreError;
use oil_event_analyzer::{
    BatchError, EventStore, NewsItem, PipelineManager, PipelineSettings, RecordFilter, Scheduler,
    SqliteEventStore,
};

fn with_broken_item(mut items: Vec<NewsItem>) -> Vec<NewsItem> {
    items.insert(
        2,
        NewsItem::new("broken", "BROKEN feed item about refinery outage", day("2024-06-03")),
    );
    items
}

#[tokio::test]
async fn failing_item_is_isolated_for_any_worker_count() {
    for workers in [1usize, 3, 8] {
        let provider = ScriptedProvider::happy();
        provider.when(
            "BROKEN",
            StageKind::SupplyDemandAnalyze,
            Err(ProviderError::Rejected("content policy".into())),
        );
        let h = Harness::new(provider);
        let items = with_broken_item(batch(6, "2024-06-03"));

        let report = Scheduler::new(h.pipeline.clone(), workers)
            .run_batch(items)
            .await
            .expect("batch");

        assert_eq!(report.total, 7, "workers={workers}");
        assert!(report.is_fully_accounted());
        assert_eq!(report.complete.len(), 6, "workers={workers}");
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].news_id, "broken");
        assert!(report.unprocessed.is_empty());

        let broken = h.store.get("broken").await.unwrap().expect("failed record kept");
        assert_eq!(broken.status, RecordStatus::Failed);
        assert!(broken.stages.classify.is_some(), "classification survives the failure");
        assert_eq!(h.store.count().await.unwrap(), 7);
    }
}

#[tokio::test]
async fn panicking_run_is_recorded_as_failed() {
    let provider = ScriptedProvider::happy();
    provider.panic_on("EXPLODE");
    let h = Harness::new(provider);
    let mut items = batch(3, "2024-06-03");
    items.push(NewsItem::new("boom", "EXPLODE headline", day("2024-06-03")));

    let report = Scheduler::new(h.pipeline.clone(), 2)
        .run_batch(items)
        .await
        .expect("batch");

    assert_eq!(report.complete.len(), 3);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].news_id, "boom");
    assert!(report.failed[0].error.contains("panicked"));

    let rec = h.store.get("boom").await.unwrap().expect("record");
    assert_eq!(rec.status, RecordStatus::Failed);
}

#[tokio::test]
async fn concurrency_never_exceeds_worker_bound() {
    let h = Harness::new(ScriptedProvider::happy().with_delay(Duration::from_millis(15)));
    let report = Scheduler::new(h.pipeline.clone(), 3)
        .run_batch(batch(12, "2024-06-03"))
        .await
        .expect("batch");

    assert_eq!(report.complete.len(), 12);
    let peak = h.provider.peak_concurrency();
    assert!(peak <= 3, "peak {peak} exceeded 3 workers");
    assert!(peak >= 2, "items should overlap, peak {peak}");
}

#[tokio::test]
async fn serial_mode_runs_one_at_a_time() {
    let h = Harness::new(ScriptedProvider::happy().with_delay(Duration::from_millis(5)));
    let report = Scheduler::new(h.pipeline.clone(), 1)
        .run_batch(batch(4, "2024-06-03"))
        .await
        .expect("batch");

    assert_eq!(report.complete.len(), 4);
    assert_eq!(h.provider.peak_concurrency(), 1);
}

#[tokio::test]
async fn deadline_leaves_remaining_items_unprocessed() {
    let h = Harness::new(ScriptedProvider::happy().with_delay(Duration::from_millis(100)));
    let report = Scheduler::new(h.pipeline.clone(), 1)
        .with_deadline(Duration::from_millis(50))
        .run_batch(batch(5, "2024-06-03"))
        .await
        .expect("deadline is not an error");

    assert!(report.is_fully_accounted());
    assert_eq!(report.complete, vec!["b-00".to_string()]);
    assert_eq!(report.unprocessed.len(), 4);
    assert!(h.store.get("b-04").await.unwrap().is_none());
}

#[tokio::test]
async fn empty_batch_is_fine() {
    let h = Harness::new(ScriptedProvider::happy());
    let report = Scheduler::new(h.pipeline.clone(), 4)
        .run_batch(Vec::new())
        .await
        .unwrap();
    assert_eq!(report.total, 0);
    assert!(report.is_fully_accounted());
}

/// Store that never answers.
struct DownStore;

#[async_trait]
impl EventStore for DownStore {
    async fn upsert(&self, _record: &CompositeRecord) -> Result<(), StoreError> {
        Err(StoreError::Task("connection refused".into()))
    }
    async fn get(&self, _news_id: &str) -> Result<Option<CompositeRecord>, StoreError> {
        Err(StoreError::Task("connection refused".into()))
    }
    async fn query(&self, _filter: &RecordFilter) -> Result<Vec<CompositeRecord>, StoreError> {
        Err(StoreError::Task("connection refused".into()))
    }
    async fn ping(&self) -> Result<(), StoreError> {
        Err(StoreError::Task("connection refused".into()))
    }
}

#[tokio::test]
async fn unreachable_store_is_a_run_level_fault() {
    let provider = Arc::new(ScriptedProvider::happy());
    let store: Arc<dyn EventStore> = Arc::new(DownStore);
    let pipeline = Arc::new(PipelineManager::new(
        client(provider.clone(), 3),
        store,
        PipelineSettings::default(),
    ));

    let err = Scheduler::new(pipeline, 3)
        .run_batch(batch(4, "2024-06-03"))
        .await
        .expect_err("store down");

    let BatchError::StoreUnavailable { report, .. } = err;
    assert_eq!(report.total, 4);
    assert_eq!(report.unprocessed.len(), 4);
    assert!(report.is_fully_accounted());
    assert!(provider.calls().is_empty(), "no model calls without a store");
}

/// Real store that goes away for good after a fixed number of successful writes.
struct FlakyStore {
    inner: Arc<SqliteEventStore>,
    writes_left: AtomicUsize,
    down: AtomicBool,
}

impl FlakyStore {
    fn new(inner: Arc<SqliteEventStore>, writes: usize) -> Self {
        Self {
            inner,
            writes_left: AtomicUsize::new(writes),
            down: AtomicBool::new(false),
        }
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Task("disk detached".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for FlakyStore {
    async fn upsert(&self, record: &CompositeRecord) -> Result<(), StoreError> {
        self.check()?;
        let granted = self
            .writes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !granted {
            self.down.store(true, Ordering::SeqCst);
            return Err(StoreError::Task("disk detached".into()));
        }
        self.inner.upsert(record).await
    }
    async fn get(&self, news_id: &str) -> Result<Option<CompositeRecord>, StoreError> {
        self.check()?;
        self.inner.get(news_id).await
    }
    async fn query(&self, filter: &RecordFilter) -> Result<Vec<CompositeRecord>, StoreError> {
        self.inner.query(filter).await
    }
    async fn ping(&self) -> Result<(), StoreError> {
        self.check()?;
        self.inner.ping().await
    }
}

#[tokio::test]
async fn store_lost_mid_batch_stops_dispatch_and_returns_partial_report() {
    let h = Harness::new(ScriptedProvider::happy());
    // A complete run writes six times: in-flight, one per stage, final status.
    // Eight writes let the first item finish and the second get past classify.
    let store: Arc<dyn EventStore> = Arc::new(FlakyStore::new(h.store.clone(), 8));
    let pipeline = Arc::new(PipelineManager::new(
        client(h.provider.clone(), 3),
        store,
        PipelineSettings::default(),
    ));

    let err = Scheduler::new(pipeline, 1)
        .run_batch(batch(5, "2024-06-03"))
        .await
        .expect_err("store lost");

    let BatchError::StoreUnavailable { source, report } = err;
    assert!(source.to_string().contains("disk detached"));
    assert!(report.is_fully_accounted());
    assert_eq!(report.complete, vec!["b-00".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].news_id, "b-01");
    assert!(report.failed[0].error.contains("persisting b-01"));
    assert_eq!(report.unprocessed, vec!["b-02", "b-03", "b-04"]);

    for later in ["Headline number 2", "Headline number 3", "Headline number 4"] {
        assert!(
            !h.provider.calls().iter().any(|r| r.user_text().contains(later)),
            "'{later}' was dispatched after the store went away"
        );
    }
    let b01 = h.store.get("b-01").await.unwrap().expect("written before the loss");
    assert!(b01.stages.classify.is_some());
    assert!(b01.stages.supply_demand.is_none());
    assert!(h.store.get("b-02").await.unwrap().is_none());
}
