// src/stage/mod.rs
//! Stages: a fixed enumeration with one dispatch contract.
//!
//! `StageKind` is the stage id seen by the client (response shape, temperature, metrics
//! label). The four per-item variants run through `StageKind::run`; `DailySummarize` is a
//! batch consumer of the store and lives in `crate::summary`.

pub mod causal;
pub mod classify;
pub mod event_type;
pub mod sentiment;
pub mod supply_demand;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::analysis::{AnalysisError, AnalysisSession, ResponseShape};
use crate::news::NewsItem;

pub use causal::CausalResult;
pub use classify::ClassifyResult;
pub use event_type::EventType;
pub use sentiment::SentimentResult;
pub use supply_demand::{Driver, QuantIndicators, SupplyDemandResult, TimeHorizon};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Classify,
    SupplyDemandAnalyze,
    SentimentScore,
    CausalValidate,
    DailySummarize,
}

impl StageKind {
    /// Per-item order. Never reordered.
    pub const PIPELINE: [StageKind; 4] = [
        StageKind::Classify,
        StageKind::SupplyDemandAnalyze,
        StageKind::SentimentScore,
        StageKind::CausalValidate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Classify => "classify",
            StageKind::SupplyDemandAnalyze => "supply_demand",
            StageKind::SentimentScore => "sentiment",
            StageKind::CausalValidate => "causal_validation",
            StageKind::DailySummarize => "daily_summary",
        }
    }

    pub fn response_shape(&self) -> ResponseShape {
        match self {
            StageKind::Classify => classify::SHAPE,
            StageKind::SupplyDemandAnalyze => supply_demand::SHAPE,
            StageKind::SentimentScore => sentiment::SHAPE,
            StageKind::CausalValidate => causal::SHAPE,
            StageKind::DailySummarize => crate::summary::SHAPE,
        }
    }

    pub fn temperature(&self) -> f32 {
        match self {
            StageKind::Classify | StageKind::SupplyDemandAnalyze | StageKind::CausalValidate => 0.1,
            StageKind::SentimentScore => 0.2,
            StageKind::DailySummarize => 0.3,
        }
    }

    pub fn is_per_item(&self) -> bool {
        !matches!(self, StageKind::DailySummarize)
    }

    /// Run one per-item stage against the accumulated context.
    pub async fn run(
        self,
        session: &mut AnalysisSession<'_>,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutput, StageError> {
        match self {
            StageKind::Classify => classify::run(session, ctx).await.map(StageOutput::Classify),
            StageKind::SupplyDemandAnalyze => supply_demand::run(session, ctx)
                .await
                .map(StageOutput::SupplyDemand),
            StageKind::SentimentScore => sentiment::run(session, ctx).await.map(StageOutput::Sentiment),
            StageKind::CausalValidate => causal::run(session, ctx).await.map(StageOutput::Causal),
            StageKind::DailySummarize => Err(StageError::NotPerItem(self)),
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error("{stage}: required input `{input}` is missing")]
    MissingInput { stage: StageKind, input: &'static str },
    #[error("{0} is not a per-item stage")]
    NotPerItem(StageKind),
}

/// Typed partial result of one stage, before it is merged into the record.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    Classify(ClassifyResult),
    SupplyDemand(SupplyDemandResult),
    Sentiment(SentimentResult),
    Causal(CausalResult),
}

impl StageOutput {
    pub fn kind(&self) -> StageKind {
        match self {
            StageOutput::Classify(_) => StageKind::Classify,
            StageOutput::SupplyDemand(_) => StageKind::SupplyDemandAnalyze,
            StageOutput::Sentiment(_) => StageKind::SentimentScore,
            StageOutput::Causal(_) => StageKind::CausalValidate,
        }
    }
}

/// Historical record handed to causal validation as a reference point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarEvent {
    pub news_id: String,
    pub title: String,
    pub event_date: NaiveDate,
    pub calibrated_intensity: Option<f64>,
    pub polarity: Option<f64>,
}

/// Everything a stage may read: the item, its resolved content and earlier stage outputs.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub item: &'a NewsItem,
    pub content: &'a str,
    pub classification: Option<&'a ClassifyResult>,
    pub supply_demand: Option<&'a SupplyDemandResult>,
    pub sentiment: Option<&'a SentimentResult>,
    pub similar_events: &'a [SimilarEvent],
}

impl<'a> StageContext<'a> {
    pub fn new(item: &'a NewsItem, content: &'a str) -> Self {
        Self {
            item,
            content,
            classification: None,
            supply_demand: None,
            sentiment: None,
            similar_events: &[],
        }
    }

    /// Common header shared by all per-item prompts.
    pub(crate) fn news_block(&self) -> String {
        format!(
            "Title: {}\nDate: {}\nCategory: {}\nContent:\n{}",
            self.item.title,
            self.item.published_at,
            if self.item.category.is_empty() {
                "-"
            } else {
                self.item.category.as_str()
            },
            self.content
        )
    }
}

/// Trim, drop empties and case-insensitive duplicates, keep first-seen order.
pub(crate) fn clean_list(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && seen.insert(s.to_lowercase()))
        .collect()
}

pub(crate) fn clean_opt(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
