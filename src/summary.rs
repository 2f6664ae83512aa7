// src/summary.rs
//! Daily summary: a batch-level, read-only consumer of the store.
//!
//! Local, deterministic parts (metrics, ranking, statistics) are plain functions over
//! records. The narrative part (risk assessments, stakeholder recommendations) is one
//! `DailySummarize` call through the analysis client.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::analysis::{AnalysisClient, AnalysisError, FieldKind, FieldSpec, PromptContext, ResponseShape};
use crate::config::SummaryConfig;
use crate::record::{CompositeRecord, RecordStatus};
use crate::stage::{clean_list, clean_opt, EventType, StageKind};
use crate::store::{window_start, EventStore, RecordFilter, StoreError};

const RISK_LEVELS: &[&str] = &["low", "medium", "high"];

const RISK: &[FieldSpec] = &[
    FieldSpec::required("assessment", FieldKind::Text),
    FieldSpec::optional("forecast", FieldKind::OptionalText),
    FieldSpec::optional("risk_factors", FieldKind::TextList),
    FieldSpec::required("risk_level", FieldKind::OneOf(RISK_LEVELS)),
    FieldSpec::required("confidence", FieldKind::Number { min: 0.0, max: 1.0 }),
];

const STAKEHOLDERS: &[FieldSpec] = &[
    FieldSpec::required("producers", FieldKind::TextOrTextList),
    FieldSpec::required("consumers", FieldKind::TextOrTextList),
    FieldSpec::required("investors", FieldKind::TextOrTextList),
    FieldSpec::required("policymakers", FieldKind::TextOrTextList),
];

pub(crate) const SHAPE: ResponseShape = ResponseShape::new(&[
    FieldSpec::required("market_overview", FieldKind::Text),
    FieldSpec::required("short_term_risk", FieldKind::Object(RISK)),
    FieldSpec::required("long_term_risk", FieldKind::Object(RISK)),
    FieldSpec::optional("key_drivers", FieldKind::TextList),
    FieldSpec::optional("event_correlation", FieldKind::OptionalText),
    FieldSpec::required("recommendations", FieldKind::Object(STAKEHOLDERS)),
]);

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("no completed oil-related events between {from} and {to}")]
    NoEvents { from: NaiveDate, to: NaiveDate },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

// ------------------------------------------------------------
// Metrics and ranking
// ------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentimentDistribution {
    pub positive: usize,
    pub negative: usize,
    pub neutral: usize,
}

impl SentimentDistribution {
    /// Largest bucket; `mixed` when the top count is shared.
    pub fn dominant(&self) -> &'static str {
        let buckets = [
            ("positive", self.positive),
            ("negative", self.negative),
            ("neutral", self.neutral),
        ];
        let max = buckets.iter().map(|(_, n)| *n).max().unwrap_or(0);
        if max == 0 {
            return "neutral";
        }
        let mut top = buckets.iter().filter(|(_, n)| *n == max);
        match (top.next(), top.next()) {
            (Some((name, _)), None) => *name,
            _ => "mixed",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetrics {
    pub total_events: usize,
    pub average_polarity: Option<f64>,
    pub average_intensity: Option<f64>,
    pub average_confidence: Option<f64>,
    pub event_type_distribution: BTreeMap<String, usize>,
    pub sentiment_distribution: SentimentDistribution,
    pub dominant_sentiment: String,
    pub most_common_event_type: Option<EventType>,
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

impl EventMetrics {
    pub fn compute(records: &[CompositeRecord]) -> Self {
        let mut by_type: BTreeMap<EventType, usize> = BTreeMap::new();
        let mut dist = SentimentDistribution::default();
        for r in records {
            if let Some(t) = r.event_type {
                *by_type.entry(t).or_default() += 1;
            }
            if let Some(s) = r.stages.sentiment.as_ref() {
                match s.label() {
                    "bullish" => dist.positive += 1,
                    "bearish" => dist.negative += 1,
                    _ => dist.neutral += 1,
                }
            }
        }
        // Ties go to the type listed first in the vocabulary.
        let most_common_event_type = EventType::ALL
            .iter()
            .filter_map(|t| by_type.get(t).map(|n| (*t, *n)))
            .fold(None::<(EventType, usize)>, |best, (t, n)| match best {
                Some((_, bn)) if bn >= n => best,
                _ => Some((t, n)),
            })
            .map(|(t, _)| t);

        Self {
            total_events: records.len(),
            average_polarity: mean(records.iter().filter_map(|r| r.polarity())),
            average_intensity: mean(records.iter().filter_map(|r| r.effective_intensity())),
            average_confidence: mean(records.iter().filter_map(|r| r.score_confidence())),
            event_type_distribution: by_type
                .into_iter()
                .map(|(t, n)| (t.as_str().to_string(), n))
                .collect(),
            dominant_sentiment: dist.dominant().to_string(),
            sentiment_distribution: dist,
            most_common_event_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopEvent {
    pub news_id: String,
    pub title: String,
    pub event_date: NaiveDate,
    pub event_type: Option<EventType>,
    /// Effective intensity × confidence.
    pub impact_score: f64,
    pub effective_intensity: f64,
    pub polarity: Option<f64>,
}

/// Highest impact first; ties broken by newer date, then id.
pub fn rank_top_events(records: &[CompositeRecord], n: usize) -> Vec<TopEvent> {
    let mut scored: Vec<TopEvent> = records
        .iter()
        .filter_map(|r| {
            Some(TopEvent {
                news_id: r.news_id.clone(),
                title: r.title.clone(),
                event_date: r.event_date,
                event_type: r.event_type,
                impact_score: r.impact_score()?,
                effective_intensity: r.effective_intensity()?,
                polarity: r.polarity(),
            })
        })
        .collect();
    scored.sort_by(|a, b| {
        b.impact_score
            .total_cmp(&a.impact_score)
            .then_with(|| b.event_date.cmp(&a.event_date))
            .then_with(|| a.news_id.cmp(&b.news_id))
    });
    scored.truncate(n);
    scored
}

// ------------------------------------------------------------
// Statistics
// ------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStats {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub total: usize,
    pub oil_related: usize,
    pub unrelated: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_event_type: BTreeMap<String, usize>,
    /// Over complete records only.
    pub mean_calibrated_intensity: Option<f64>,
}

impl EventStats {
    pub fn compute(records: &[CompositeRecord], from: NaiveDate, to: NaiveDate) -> Self {
        let mut by_status = BTreeMap::new();
        let mut by_event_type = BTreeMap::new();
        for r in records {
            *by_status.entry(r.status.as_str().to_string()).or_insert(0) += 1;
            if let Some(t) = r.event_type {
                *by_event_type.entry(t.as_str().to_string()).or_insert(0) += 1;
            }
        }
        let oil_related = records.iter().filter(|r| r.is_oil_related).count();
        Self {
            from,
            to,
            total: records.len(),
            oil_related,
            unrelated: records.len() - oil_related,
            by_status,
            by_event_type,
            mean_calibrated_intensity: mean(
                records
                    .iter()
                    .filter(|r| r.status == RecordStatus::Complete)
                    .filter_map(|r| r.stages.causal_validation.as_ref())
                    .map(|c| c.calibrated_intensity),
            ),
        }
    }
}

/// Statistics over every record dated `days_back` days before `as_of` up to `as_of`.
pub async fn event_stats(
    store: &dyn EventStore,
    as_of: NaiveDate,
    days_back: u32,
) -> Result<EventStats, StoreError> {
    let from = window_start(as_of, days_back);
    let records = store.query(&RecordFilter::window(from, as_of)).await?;
    Ok(EventStats::compute(&records, from, as_of))
}

// ------------------------------------------------------------
// Model-backed summary
// ------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    fn from_label(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => RiskLevel::High,
            "medium" => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub assessment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forecast: Option<String>,
    #[serde(default)]
    pub risk_factors: Vec<String>,
    pub risk_level: RiskLevel,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StakeholderRecommendations {
    pub producers: Vec<String>,
    pub consumers: Vec<String>,
    pub investors: Vec<String>,
    pub policymakers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    pub as_of: NaiveDate,
    pub days_back: u32,
    pub metrics: EventMetrics,
    pub top_events: Vec<TopEvent>,
    pub market_overview: String,
    pub short_term_risk: RiskAssessment,
    pub long_term_risk: RiskAssessment,
    #[serde(default)]
    pub key_drivers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_correlation: Option<String>,
    pub recommendations: StakeholderRecommendations,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => clean_list(vec![s]),
            OneOrMany::Many(v) => clean_list(v),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawRisk {
    assessment: String,
    #[serde(default)]
    forecast: Option<String>,
    #[serde(default)]
    risk_factors: Vec<String>,
    risk_level: String,
    confidence: f64,
}

impl From<RawRisk> for RiskAssessment {
    fn from(r: RawRisk) -> Self {
        Self {
            assessment: r.assessment.trim().to_string(),
            forecast: clean_opt(r.forecast),
            risk_factors: clean_list(r.risk_factors),
            risk_level: RiskLevel::from_label(&r.risk_level),
            confidence: r.confidence,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawStakeholders {
    producers: OneOrMany,
    consumers: OneOrMany,
    investors: OneOrMany,
    policymakers: OneOrMany,
}

#[derive(Debug, Deserialize)]
struct RawSummary {
    market_overview: String,
    short_term_risk: RawRisk,
    long_term_risk: RawRisk,
    #[serde(default)]
    key_drivers: Vec<String>,
    #[serde(default)]
    event_correlation: Option<String>,
    recommendations: RawStakeholders,
}

#[derive(Serialize)]
struct PromptEvent<'a> {
    id: &'a str,
    title: &'a str,
    date: NaiveDate,
    event_type: Option<EventType>,
    polarity: Option<f64>,
    intensity: Option<f64>,
    confidence: Option<f64>,
    transmission_path: Option<&'a [String]>,
}

pub struct DailySummarizer {
    client: Arc<AnalysisClient>,
    store: Arc<dyn EventStore>,
    cfg: SummaryConfig,
}

impl DailySummarizer {
    pub fn new(client: Arc<AnalysisClient>, store: Arc<dyn EventStore>, cfg: SummaryConfig) -> Self {
        Self { client, store, cfg }
    }

    /// Summarize the completed oil-related events in the window ending at `as_of`.
    pub async fn summarize(&self, as_of: NaiveDate) -> Result<DailySummary, SummaryError> {
        let from = window_start(as_of, self.cfg.days_back);
        let filter = RecordFilter::window(from, as_of)
            .oil_related(true)
            .status(RecordStatus::Complete)
            .limit(self.cfg.max_events);
        let records = self.store.query(&filter).await?;
        if records.is_empty() {
            return Err(SummaryError::NoEvents { from, to: as_of });
        }

        let metrics = EventMetrics::compute(&records);
        let top_events = rank_top_events(&records, self.cfg.top_n);
        let ctx = self.prompt(as_of, &metrics, &top_events, &records);

        let raw: RawSummary = self
            .client
            .session()
            .invoke(StageKind::DailySummarize, &ctx)
            .await?;

        info!(as_of = %as_of, events = records.len(), "daily summary generated");
        Ok(DailySummary {
            as_of,
            days_back: self.cfg.days_back,
            metrics,
            top_events,
            market_overview: raw.market_overview.trim().to_string(),
            short_term_risk: raw.short_term_risk.into(),
            long_term_risk: raw.long_term_risk.into(),
            key_drivers: clean_list(raw.key_drivers),
            event_correlation: clean_opt(raw.event_correlation),
            recommendations: StakeholderRecommendations {
                producers: raw.recommendations.producers.into_vec(),
                consumers: raw.recommendations.consumers.into_vec(),
                investors: raw.recommendations.investors.into_vec(),
                policymakers: raw.recommendations.policymakers.into_vec(),
            },
            generated_at: Utc::now(),
        })
    }

    fn prompt(
        &self,
        as_of: NaiveDate,
        metrics: &EventMetrics,
        top: &[TopEvent],
        records: &[CompositeRecord],
    ) -> PromptContext {
        let system = format!(
            "You are a senior oil market risk analyst writing a daily briefing. From the \
             analysed events, assess short-term (days to weeks) and long-term (months) \
             crude price risk, name the key drivers, relate the events to each other and \
             give concrete recommendations for producers, consumers, investors and \
             policymakers. risk_level is one of [{}].\n\
             Reply with ONLY a JSON object with these fields: {}",
            RISK_LEVELS.join(", "),
            SHAPE.describe()
        );
        let events: Vec<PromptEvent<'_>> = records
            .iter()
            .map(|r| PromptEvent {
                id: &r.news_id,
                title: &r.title,
                date: r.event_date,
                event_type: r.event_type,
                polarity: r.polarity(),
                intensity: r.effective_intensity(),
                confidence: r.score_confidence(),
                transmission_path: r
                    .stages
                    .supply_demand
                    .as_ref()
                    .map(|sd| sd.transmission_path.as_slice()),
            })
            .collect();
        let user = format!(
            "Date: {as_of} (window: {} days)\n\nMetrics:\n{}\n\nTop events:\n{}\n\nEvents:\n{}",
            self.cfg.days_back,
            serde_json::to_string_pretty(metrics).unwrap_or_default(),
            serde_json::to_string_pretty(top).unwrap_or_default(),
            serde_json::to_string(&events).unwrap_or_default(),
        );
        PromptContext::new(system, user, StageKind::DailySummarize.temperature())
    }
}
