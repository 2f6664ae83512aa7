// src/store/sqlite.rs
//! SQLite-backed EventStore.
//!
//! One connection per operation on the blocking pool, created on demand. WAL mode is
//! switched on once at open (it persists in the database file) and every connection
//! carries a busy timeout, so concurrent writers for distinct ids proceed without any
//! lock held in this process.
//! The unique index on `news_id` turns racing same-id writes into last-writer-wins.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use metrics::counter;
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{EventStore, RecordFilter, StoreError};
use crate::record::{CompositeRecord, RecordStatus, StageEntries};
use crate::stage::EventType;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Contents of the `data` column.
#[derive(Debug, Serialize, Deserialize)]
struct RecordData {
    title: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    url: String,
    stages: StageEntries,
    status: RecordStatus,
    #[serde(default)]
    error: Option<String>,
}

pub struct SqliteEventStore {
    db_path: PathBuf,
}

impl SqliteEventStore {
    /// Open (creating parent directories and schema as needed).
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = connect(&self.db_path)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                news_id TEXT NOT NULL UNIQUE,
                event_date TEXT NOT NULL,
                is_oil_related INTEGER NOT NULL DEFAULT 0,
                event_type TEXT,
                status TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_event_date ON events(event_date);
            CREATE INDEX IF NOT EXISTS idx_events_oil_related ON events(is_oil_related);
            CREATE INDEX IF NOT EXISTS idx_events_event_type ON events(event_type);
            CREATE INDEX IF NOT EXISTS idx_events_status ON events(status);
        "#,
        )?;
        Ok(())
    }

    /// Delete every record. Maintenance only; the pipeline never deletes.
    pub async fn clear(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| Ok(conn.execute("DELETE FROM events", [])?))
            .await
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?;
            Ok(n.max(0) as usize)
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = connect(&path)?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn connect(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn upsert(&self, record: &CompositeRecord) -> Result<(), StoreError> {
        let data = serde_json::to_string(&RecordData {
            title: record.title.clone(),
            category: record.category.clone(),
            url: record.url.clone(),
            stages: record.stages.clone(),
            status: record.status,
            error: record.error.clone(),
        })?;
        let news_id = record.news_id.clone();
        let event_date = record.event_date.format("%Y-%m-%d").to_string();
        let is_oil_related = record.is_oil_related;
        let event_type = record.event_type.map(|t| t.as_str());
        let status = record.status.as_str();
        let created_at = record.created_at.to_rfc3339();
        let updated_at = record.updated_at.to_rfc3339();

        let res = self
            .with_conn(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO events
                        (news_id, event_date, is_oil_related, event_type, status, data, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                    ON CONFLICT(news_id) DO UPDATE SET
                        event_date = excluded.event_date,
                        is_oil_related = excluded.is_oil_related,
                        event_type = excluded.event_type,
                        status = excluded.status,
                        data = excluded.data,
                        updated_at = excluded.updated_at
                    "#,
                    params![
                        news_id,
                        event_date,
                        is_oil_related,
                        event_type,
                        status,
                        data,
                        created_at,
                        updated_at
                    ],
                )?;
                Ok(())
            })
            .await;
        if res.is_err() {
            counter!("store_upsert_errors_total").increment(1);
        }
        res
    }

    async fn get(&self, news_id: &str) -> Result<Option<CompositeRecord>, StoreError> {
        let news_id = news_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE news_id = ?1"))?;
            let raw = stmt.query_row(params![news_id], RawRow::from_row).optional()?;
            raw.map(RawRow::into_record).transpose()
        })
        .await
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<CompositeRecord>, StoreError> {
        let (sql, args) = build_query(filter);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(args.iter()), RawRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(RawRow::into_record).collect()
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}

// ------------------------------------------------------------
// Row mapping
// ------------------------------------------------------------

const SELECT_COLUMNS: &str = "SELECT news_id, event_date, is_oil_related, event_type, data, \
                              created_at, updated_at FROM events";

fn build_query(filter: &RecordFilter) -> (String, Vec<SqlValue>) {
    let mut clauses: Vec<&str> = Vec::new();
    let mut args: Vec<SqlValue> = Vec::new();
    if let Some(from) = filter.from {
        clauses.push("event_date >= ?");
        args.push(SqlValue::Text(from.format("%Y-%m-%d").to_string()));
    }
    if let Some(to) = filter.to {
        clauses.push("event_date <= ?");
        args.push(SqlValue::Text(to.format("%Y-%m-%d").to_string()));
    }
    if let Some(v) = filter.is_oil_related {
        clauses.push("is_oil_related = ?");
        args.push(SqlValue::Integer(i64::from(v)));
    }
    if let Some(t) = filter.event_type {
        clauses.push("event_type = ?");
        args.push(SqlValue::Text(t.as_str().to_string()));
    }
    if let Some(s) = filter.status {
        clauses.push("status = ?");
        args.push(SqlValue::Text(s.as_str().to_string()));
    }

    let mut sql = SELECT_COLUMNS.to_string();
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY event_date DESC, updated_at DESC, news_id ASC");
    if let Some(n) = filter.limit {
        sql.push_str(" LIMIT ?");
        args.push(SqlValue::Integer(n.min(i64::MAX as usize) as i64));
    }
    (sql, args)
}

struct RawRow {
    news_id: String,
    event_date: String,
    is_oil_related: bool,
    event_type: Option<String>,
    data: String,
    created_at: String,
    updated_at: String,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            news_id: row.get("news_id")?,
            event_date: row.get("event_date")?,
            is_oil_related: row.get("is_oil_related")?,
            event_type: row.get("event_type")?,
            data: row.get("data")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn into_record(self) -> Result<CompositeRecord, StoreError> {
        let corrupt = |what: &str, v: &str| StoreError::Corrupt(format!("{}: bad {what} {v:?}", self.news_id));
        let event_date = NaiveDate::parse_from_str(&self.event_date, "%Y-%m-%d")
            .map_err(|_| corrupt("event_date", &self.event_date))?;
        let event_type = match self.event_type.as_deref() {
            None => None,
            Some(s) => Some(s.parse::<EventType>().map_err(|_| corrupt("event_type", s))?),
        };
        let created_at = parse_ts(&self.created_at).ok_or_else(|| corrupt("created_at", &self.created_at))?;
        let updated_at = parse_ts(&self.updated_at).ok_or_else(|| corrupt("updated_at", &self.updated_at))?;
        let data: RecordData = serde_json::from_str(&self.data)?;
        Ok(CompositeRecord {
            news_id: self.news_id,
            event_date,
            title: data.title,
            category: data.category,
            url: data.url,
            is_oil_related: self.is_oil_related,
            event_type,
            stages: data.stages,
            status: data.status,
            error: data.error,
            created_at,
            updated_at,
        })
    }
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
