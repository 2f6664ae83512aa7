// tests/store_sqlite.rs
//
// SqliteEventStore contract: upsert idempotence, concurrent writers, filters, similar events.

mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::day;
use oil_event_analyzer::record::{CompositeRecord, RecordStatus};
use oil_event_analyzer::stage::{ClassifyResult, EventType, SentimentResult, StageOutput};
use oil_event_analyzer::{EventStore, NewsItem, RecordFilter, SqliteEventStore};

fn open() -> (tempfile::TempDir, Arc<SqliteEventStore>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteEventStore::open(&dir.path().join("nested/dir/events.db")).expect("open");
    (dir, Arc::new(store))
}

fn record(id: &str, date: &str, oil: bool, t: EventType, status: RecordStatus) -> CompositeRecord {
    let item = NewsItem::new(id, format!("title {id}"), day(date));
    let mut rec = CompositeRecord::in_flight(&item, Utc::now());
    rec.apply(StageOutput::Classify(ClassifyResult {
        is_oil_related: oil,
        event_type: t,
        confidence: 0.9,
        keywords: vec![],
        entities: vec![],
        reason: None,
        unrecognized_label: None,
    }));
    if status == RecordStatus::Complete {
        rec.apply(StageOutput::Sentiment(SentimentResult {
            polarity: 0.5,
            intensity: 0.6,
            confidence: 0.7,
            basis: None,
        }));
    }
    rec.finalize(status, None, Utc::now());
    rec
}

#[tokio::test]
async fn upsert_replaces_and_keeps_created_at() {
    let (_dir, store) = open();
    let first = record("a", "2024-06-01", true, EventType::Policy, RecordStatus::Partial);
    store.upsert(&first).await.unwrap();

    let mut second = record("a", "2024-06-01", true, EventType::Policy, RecordStatus::Complete);
    second.created_at = first.created_at + Duration::hours(1);
    store.upsert(&second).await.unwrap();

    let got = store.get("a").await.unwrap().expect("present");
    assert_eq!(store.count().await.unwrap(), 1);
    assert_eq!(got.status, RecordStatus::Complete);
    assert_eq!(got.created_at, first.created_at);
    assert!(got.stages.sentiment.is_some());
}

#[tokio::test]
async fn missing_record_is_none() {
    let (_dir, store) = open();
    assert!(store.get("nope").await.unwrap().is_none());
    store.ping().await.expect("ping");
}

#[tokio::test]
async fn concurrent_writers_produce_one_row_per_id() {
    let (_dir, store) = open();
    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..40 {
        let store = store.clone();
        tasks.spawn(async move {
            // Ten ids, four writers each.
            let id = format!("id-{}", i % 10);
            let rec = record(&id, "2024-06-02", true, EventType::Macro, RecordStatus::Complete);
            store.upsert(&rec).await
        });
    }
    while let Some(res) = tasks.join_next().await {
        res.expect("join").expect("upsert");
    }
    assert_eq!(store.count().await.unwrap(), 10);
}

#[tokio::test]
async fn query_filters_and_orders_newest_first() {
    let (_dir, store) = open();
    for rec in [
        record("old", "2024-05-01", true, EventType::Policy, RecordStatus::Complete),
        record("mid", "2024-06-01", true, EventType::Inventory, RecordStatus::Complete),
        record("new", "2024-06-10", true, EventType::Policy, RecordStatus::Complete),
        record("noise", "2024-06-05", false, EventType::Other, RecordStatus::Partial),
    ] {
        store.upsert(&rec).await.unwrap();
    }

    let all = store.query(&RecordFilter::default()).await.unwrap();
    let ids: Vec<_> = all.iter().map(|r| r.news_id.as_str()).collect();
    assert_eq!(ids, vec!["new", "noise", "mid", "old"]);

    let june = store
        .query(&RecordFilter::window(day("2024-06-01"), day("2024-06-30")).oil_related(true))
        .await
        .unwrap();
    let ids: Vec<_> = june.iter().map(|r| r.news_id.as_str()).collect();
    assert_eq!(ids, vec!["new", "mid"]);

    let policy = store
        .query(&RecordFilter::default().event_type(EventType::Policy).limit(1))
        .await
        .unwrap();
    assert_eq!(policy.len(), 1);
    assert_eq!(policy[0].news_id, "new");

    let partial = store
        .query(&RecordFilter::default().status(RecordStatus::Partial))
        .await
        .unwrap();
    assert_eq!(partial.len(), 1);
    assert!(!partial[0].is_oil_related);
}

#[tokio::test]
async fn similar_events_match_type_window_and_status() {
    let (_dir, store) = open();
    for rec in [
        record("p1", "2024-06-01", true, EventType::Policy, RecordStatus::Complete),
        record("p2", "2024-05-25", true, EventType::Policy, RecordStatus::Complete),
        record("p-old", "2024-03-01", true, EventType::Policy, RecordStatus::Complete),
        record("p-partial", "2024-06-02", true, EventType::Policy, RecordStatus::Partial),
        record("w1", "2024-06-02", true, EventType::Weather, RecordStatus::Complete),
    ] {
        store.upsert(&rec).await.unwrap();
    }
    let current = record("cur", "2024-06-03", true, EventType::Policy, RecordStatus::InFlight);
    store.upsert(&current).await.unwrap();

    let similar = store.similar_events(&current, 30, 5).await.unwrap();
    let ids: Vec<_> = similar.iter().map(|s| s.news_id.as_str()).collect();
    assert_eq!(ids, vec!["p1", "p2"]);
    assert_eq!(similar[0].calibrated_intensity, Some(0.6));

    let capped = store.similar_events(&current, 30, 1).await.unwrap();
    assert_eq!(capped.len(), 1);
}

#[tokio::test]
async fn clear_removes_everything() {
    let (_dir, store) = open();
    store
        .upsert(&record("x", "2024-06-01", true, EventType::Macro, RecordStatus::Complete))
        .await
        .unwrap();
    assert_eq!(store.clear().await.unwrap(), 1);
    assert_eq!(store.count().await.unwrap(), 0);
}
