// src/store/mod.rs
//! EventStore: the only write path for analysis results and the only channel to readers.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use serde::Deserialize;
use thiserror::Error;

use crate::record::{CompositeRecord, RecordStatus};
use crate::stage::{EventType, SimilarEvent};

pub use sqlite::SqliteEventStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("record (de)serialization: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store task failed: {0}")]
    Task(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Read-side filter. Unset fields do not constrain; date bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RecordFilter {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub is_oil_related: Option<bool>,
    pub event_type: Option<EventType>,
    pub status: Option<RecordStatus>,
    pub limit: Option<usize>,
}

/// First day of a window of `days` days ending at `end`. Saturates at the earliest
/// representable date instead of overflowing.
pub fn window_start(end: NaiveDate, days: u32) -> NaiveDate {
    end.checked_sub_signed(Duration::days(i64::from(days)))
        .unwrap_or(NaiveDate::MIN)
}

impl RecordFilter {
    /// Everything dated within `[from, to]`.
    pub fn window(from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            ..Self::default()
        }
    }

    pub fn oil_related(mut self, v: bool) -> Self {
        self.is_oil_related = Some(v);
        self
    }

    pub fn event_type(mut self, t: EventType) -> Self {
        self.event_type = Some(t);
        self
    }

    pub fn status(mut self, s: RecordStatus) -> Self {
        self.status = Some(s);
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert or replace the record for `record.news_id`. Safe to call concurrently;
    /// racing writers for the same id resolve last-writer-wins.
    async fn upsert(&self, record: &CompositeRecord) -> Result<(), StoreError>;

    async fn get(&self, news_id: &str) -> Result<Option<CompositeRecord>, StoreError>;

    /// Newest first (event date, then last update).
    async fn query(&self, filter: &RecordFilter) -> Result<Vec<CompositeRecord>, StoreError>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Completed oil-related records of the same type from the `days` before the record's
    /// date, excluding the record itself.
    async fn similar_events(
        &self,
        record: &CompositeRecord,
        days: u32,
        limit: usize,
    ) -> Result<Vec<SimilarEvent>, StoreError> {
        let Some(event_type) = record.event_type else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }
        let filter = RecordFilter::window(window_start(record.event_date, days), record.event_date)
        .oil_related(true)
        .event_type(event_type)
        .status(RecordStatus::Complete)
        .limit(limit + 1);
        Ok(self
            .query(&filter)
            .await?
            .into_iter()
            .filter(|r| r.news_id != record.news_id)
            .take(limit)
            .map(|r| r.as_similar_event())
            .collect())
    }
}
