// src/record.rs
//! The durable unit: one `CompositeRecord` per news id.
//!
//! A record is written in its in-flight form when a run starts, filled in as each stage
//! completes and finalized (status + `updated_at`) when the run terminates.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::news::NewsItem;
use crate::stage::{
    CausalResult, ClassifyResult, EventType, SentimentResult, SimilarEvent, StageContext,
    StageKind, StageOutput, SupplyDemandResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Written at run start; never the status of a finished run.
    InFlight,
    Complete,
    Partial,
    Failed,
}

impl RecordStatus {
    pub const FINAL: [RecordStatus; 3] = [
        RecordStatus::Complete,
        RecordStatus::Partial,
        RecordStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::InFlight => "in_flight",
            RecordStatus::Complete => "complete",
            RecordStatus::Partial => "partial",
            RecordStatus::Failed => "failed",
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, RecordStatus::InFlight)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in_flight" => Ok(RecordStatus::InFlight),
            "complete" => Ok(RecordStatus::Complete),
            "partial" => Ok(RecordStatus::Partial),
            "failed" => Ok(RecordStatus::Failed),
            other => Err(format!("unknown record status: {other}")),
        }
    }
}

/// Stage-name → result map. Every key is always present; `null` means skipped or not run.
/// Each stage owns exactly one key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageEntries {
    #[serde(default)]
    pub classify: Option<ClassifyResult>,
    #[serde(default)]
    pub supply_demand: Option<SupplyDemandResult>,
    #[serde(default)]
    pub sentiment: Option<SentimentResult>,
    #[serde(default)]
    pub causal_validation: Option<CausalResult>,
}

impl StageEntries {
    /// Store one stage's output under its own key.
    pub fn merge(&mut self, output: StageOutput) {
        match output {
            StageOutput::Classify(r) => self.classify = Some(r),
            StageOutput::SupplyDemand(r) => self.supply_demand = Some(r),
            StageOutput::Sentiment(r) => self.sentiment = Some(r),
            StageOutput::Causal(r) => self.causal_validation = Some(r),
        }
    }

    pub fn is_populated(&self, stage: StageKind) -> bool {
        match stage {
            StageKind::Classify => self.classify.is_some(),
            StageKind::SupplyDemandAnalyze => self.supply_demand.is_some(),
            StageKind::SentimentScore => self.sentiment.is_some(),
            StageKind::CausalValidate => self.causal_validation.is_some(),
            StageKind::DailySummarize => false,
        }
    }

    /// Names of the populated entries, in pipeline order.
    pub fn populated(&self) -> Vec<&'static str> {
        StageKind::PIPELINE
            .iter()
            .filter(|s| self.is_populated(**s))
            .map(|s| s.as_str())
            .collect()
    }

    /// True when nothing past classification has been written.
    pub fn downstream_empty(&self) -> bool {
        self.supply_demand.is_none() && self.sentiment.is_none() && self.causal_validation.is_none()
    }

    pub fn context<'a>(
        &'a self,
        item: &'a NewsItem,
        content: &'a str,
        similar_events: &'a [SimilarEvent],
    ) -> StageContext<'a> {
        StageContext {
            item,
            content,
            classification: self.classify.as_ref(),
            supply_demand: self.supply_demand.as_ref(),
            sentiment: self.sentiment.as_ref(),
            similar_events,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeRecord {
    pub news_id: String,
    pub event_date: NaiveDate,
    pub title: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub url: String,
    pub is_oil_related: bool,
    /// `None` until classification has run.
    pub event_type: Option<EventType>,
    pub stages: StageEntries,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CompositeRecord {
    pub fn in_flight(item: &NewsItem, now: DateTime<Utc>) -> Self {
        Self {
            news_id: item.id.clone(),
            event_date: item.published_at,
            title: item.title.clone(),
            category: item.category.clone(),
            url: item.url.clone(),
            is_oil_related: false,
            event_type: None,
            stages: StageEntries::default(),
            status: RecordStatus::InFlight,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record classification and lift its verdict onto the indexed columns.
    pub fn apply(&mut self, output: StageOutput) {
        if let StageOutput::Classify(c) = &output {
            self.is_oil_related = c.is_oil_related;
            self.event_type = Some(c.event_type);
        }
        self.stages.merge(output);
    }

    pub fn finalize(&mut self, status: RecordStatus, error: Option<String>, now: DateTime<Utc>) {
        self.status = status;
        self.error = error;
        self.updated_at = now;
    }

    /// Intensity consumers should use: calibrated when validation ran, raw otherwise.
    pub fn effective_intensity(&self) -> Option<f64> {
        self.stages
            .causal_validation
            .as_ref()
            .map(|c| c.calibrated_intensity)
            .or_else(|| self.stages.sentiment.as_ref().map(|s| s.intensity))
    }

    pub fn polarity(&self) -> Option<f64> {
        self.stages.sentiment.as_ref().map(|s| s.polarity)
    }

    /// Confidence of the most authoritative score present.
    pub fn score_confidence(&self) -> Option<f64> {
        self.stages
            .causal_validation
            .as_ref()
            .map(|c| c.confidence)
            .or_else(|| self.stages.sentiment.as_ref().map(|s| s.confidence))
    }

    /// Ranking weight used by the daily summary: effective intensity × confidence.
    pub fn impact_score(&self) -> Option<f64> {
        Some(self.effective_intensity()? * self.score_confidence()?)
    }

    pub fn as_similar_event(&self) -> SimilarEvent {
        SimilarEvent {
            news_id: self.news_id.clone(),
            title: self.title.clone(),
            event_date: self.event_date,
            calibrated_intensity: self.effective_intensity(),
            polarity: self.polarity(),
        }
    }
}
