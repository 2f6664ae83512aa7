// src/api.rs
//! Read-only HTTP surface over the event store for the reporting layer.
//! Nothing here writes; the pipeline is the only writer.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::config::MAX_DAYS_BACK;
use crate::metrics::Metrics;
use crate::record::{CompositeRecord, RecordStatus};
use crate::stage::EventType;
use crate::store::{EventStore, RecordFilter, StoreError};
use crate::summary::{event_stats, EventStats};

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1_000;
const DEFAULT_STATS_DAYS: u32 = 7;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub metrics: Option<Metrics>,
}

impl AppState {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

pub fn create_router(state: AppState) -> Router {
    let metrics = state.metrics.clone();
    let router = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/events", get(list_events))
        .route("/events/{news_id}", get(get_event))
        .route("/stats", get(stats))
        .layer(CorsLayer::very_permissive())
        .with_state(state);
    match metrics {
        Some(m) => router.merge(m.router()),
        None => router,
    }
}

// ------------------------------------------------------------
// Errors
// ------------------------------------------------------------

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Store(e) => {
                warn!(error = %e, "store read failed");
                (StatusCode::SERVICE_UNAVAILABLE, "event store unavailable".to_string())
            }
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

// ------------------------------------------------------------
// Handlers
// ------------------------------------------------------------

async fn get_event(
    State(state): State<AppState>,
    Path(news_id): Path<String>,
) -> Result<Json<CompositeRecord>, ApiError> {
    state
        .store
        .get(&news_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no record for news_id {news_id}")))
}

#[derive(Debug, Default, Deserialize)]
struct EventsQuery {
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    oil_related: Option<bool>,
    event_type: Option<String>,
    status: Option<String>,
    limit: Option<usize>,
}

impl EventsQuery {
    fn into_filter(self) -> Result<RecordFilter, ApiError> {
        let event_type = self
            .event_type
            .as_deref()
            .map(|s| s.parse::<EventType>().map_err(ApiError::BadRequest))
            .transpose()?;
        let status = self
            .status
            .as_deref()
            .map(|s| s.parse::<RecordStatus>().map_err(ApiError::BadRequest))
            .transpose()?;
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(ApiError::BadRequest(format!("from {from} is after to {to}")));
            }
        }
        Ok(RecordFilter {
            from: self.from,
            to: self.to,
            is_oil_related: self.oil_related,
            event_type,
            status,
            limit: Some(self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)),
        })
    }
}

async fn list_events(
    State(state): State<AppState>,
    Query(q): Query<EventsQuery>,
) -> Result<Json<Vec<CompositeRecord>>, ApiError> {
    let filter = q.into_filter()?;
    Ok(Json(state.store.query(&filter).await?))
}

#[derive(Debug, Default, Deserialize)]
struct StatsQuery {
    days_back: Option<u32>,
    as_of: Option<NaiveDate>,
}

async fn stats(
    State(state): State<AppState>,
    Query(q): Query<StatsQuery>,
) -> Result<Json<EventStats>, ApiError> {
    let as_of = q.as_of.unwrap_or_else(|| Utc::now().date_naive());
    let days = q.days_back.unwrap_or(DEFAULT_STATS_DAYS);
    if days > MAX_DAYS_BACK {
        return Err(ApiError::BadRequest(format!(
            "days_back {days} exceeds the maximum of {MAX_DAYS_BACK}"
        )));
    }
    Ok(Json(event_stats(state.store.as_ref(), as_of, days).await?))
}
