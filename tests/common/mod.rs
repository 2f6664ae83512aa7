// tests/common/mod.rs
//
// Shared fixtures for integration tests: a scripted model provider, canned stage replies,
// and helpers that wire a pipeline over a throwaway SQLite file.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::json;
use tempfile::TempDir;

use oil_event_analyzer::analysis::{ModelRequest, Provider, ProviderError};
use oil_event_analyzer::stage::StageKind;
use oil_event_analyzer::{
    AnalysisClient, EventStore, NewsItem, PipelineManager, PipelineSettings, RetryPolicy,
    SqliteEventStore,
};

pub type Reply = Result<String, ProviderError>;

/// Provider double. Replies are picked in this order:
/// 1) a marker rule whose text appears in the request's user content,
/// 2) the next queued reply for the stage,
/// 3) the stage default.
pub struct ScriptedProvider {
    defaults: Mutex<HashMap<StageKind, Reply>>,
    queued: Mutex<HashMap<StageKind, VecDeque<Reply>>>,
    rules: Mutex<Vec<(String, StageKind, Reply)>>,
    panic_marker: Mutex<Option<String>>,
    calls: Mutex<Vec<ModelRequest>>,
    delay: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedProvider {
    /// Every stage answers with a valid, oil-related, high-confidence reply.
    pub fn happy() -> Self {
        let mut defaults = HashMap::new();
        defaults.insert(StageKind::Classify, Ok(classify_json(true, "geopolitical", 0.9)));
        defaults.insert(StageKind::SupplyDemandAnalyze, Ok(supply_demand_json()));
        defaults.insert(StageKind::SentimentScore, Ok(sentiment_json(0.7, 0.8)));
        defaults.insert(StageKind::CausalValidate, Ok(causal_json(0.75)));
        defaults.insert(StageKind::DailySummarize, Ok(summary_json()));
        Self {
            defaults: Mutex::new(defaults),
            queued: Mutex::new(HashMap::new()),
            rules: Mutex::new(Vec::new()),
            panic_marker: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_default(&self, stage: StageKind, reply: Reply) {
        self.defaults.lock().unwrap().insert(stage, reply);
    }

    pub fn enqueue(&self, stage: StageKind, reply: Reply) {
        self.queued
            .lock()
            .unwrap()
            .entry(stage)
            .or_default()
            .push_back(reply);
    }

    /// Requests whose user content contains `marker` get `reply` for `stage`.
    pub fn when(&self, marker: &str, stage: StageKind, reply: Reply) {
        self.rules
            .lock()
            .unwrap()
            .push((marker.to_string(), stage, reply));
    }

    /// Requests whose user content contains `marker` panic inside the provider.
    pub fn panic_on(&self, marker: &str) {
        *self.panic_marker.lock().unwrap() = Some(marker.to_string());
    }

    pub fn calls(&self) -> Vec<ModelRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, stage: StageKind) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.stage == stage)
            .count()
    }

    /// Highest number of `complete` calls observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn pick(&self, request: &ModelRequest) -> Reply {
        let text = request.user_text();
        if let Some((_, _, reply)) = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .find(|(marker, stage, _)| *stage == request.stage && text.contains(marker.as_str()))
        {
            return reply.clone();
        }
        if let Some(reply) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&request.stage)
            .and_then(|q| q.pop_front())
        {
            return reply;
        }
        self.defaults
            .lock()
            .unwrap()
            .get(&request.stage)
            .cloned()
            .unwrap_or_else(|| Err(ProviderError::Rejected(format!("no script for {}", request.stage))))
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn complete(&self, request: &ModelRequest) -> Result<String, ProviderError> {
        self.calls.lock().unwrap().push(request.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        let marker = self.panic_marker.lock().unwrap().clone();
        if let Some(m) = marker {
            if request.user_text().contains(&m) {
                panic!("scripted provider panic for {m}");
            }
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.pick(request)
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

// ------------------------------------------------------------
// Canned replies
// ------------------------------------------------------------

pub fn classify_json(oil: bool, event_type: &str, confidence: f64) -> String {
    json!({
        "is_oil_related": oil,
        "event_type": event_type,
        "confidence": confidence,
        "keywords": ["OPEC+", "production cut"],
        "entities": ["Saudi Arabia"],
        "reason": "supply decision by a major producer"
    })
    .to_string()
}

pub fn supply_demand_json() -> String {
    json!({
        "drivers": ["supply"],
        "key_entities": ["Saudi Aramco", "OPEC+"],
        "quantitative_indicators": {
            "supply_change_pct": -1.0,
            "demand_change_pct": null,
            "inventory_change_mb": null,
            "price_impact_pct": 3.5,
            "time_horizon": "short"
        },
        "transmission_path": "production cut -> lower supply -> higher price",
        "confidence": 0.8,
        "uncertainties": ["compliance"],
        "reasoning": "1 mb/d removed from the market"
    })
    .to_string()
}

pub fn sentiment_json(polarity: f64, intensity: f64) -> String {
    json!({
        "polarity": polarity,
        "intensity": intensity,
        "confidence": 0.8,
        "basis": "supply tightening"
    })
    .to_string()
}

pub fn causal_json(calibrated: f64) -> String {
    json!({
        "is_causal": true,
        "calibrated_intensity": calibrated,
        "path_completeness": 0.9,
        "confounding_factors": ["demand outlook"],
        "confidence": 0.8,
        "warning": null,
        "reasoning": "path is complete"
    })
    .to_string()
}

pub fn summary_json() -> String {
    json!({
        "market_overview": "Supply-side risk dominates after the OPEC+ decision.",
        "short_term_risk": {
            "assessment": "Upside price risk",
            "forecast": "Brent firm",
            "risk_factors": ["compliance"],
            "risk_level": "high",
            "confidence": 0.7
        },
        "long_term_risk": {
            "assessment": "Balanced",
            "risk_level": "medium",
            "confidence": 0.5
        },
        "key_drivers": ["OPEC+ policy"],
        "event_correlation": "Cuts reinforce each other.",
        "recommendations": {
            "producers": "Hedge part of output",
            "consumers": ["Lock in supply contracts"],
            "investors": ["Watch compliance data"],
            "policymakers": ["Review strategic reserves"]
        }
    })
    .to_string()
}

// ------------------------------------------------------------
// Wiring
// ------------------------------------------------------------

/// No backoff so retry tests stay fast.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        jitter: Duration::ZERO,
    }
}

pub fn client(provider: Arc<ScriptedProvider>, max_attempts: u32) -> Arc<AnalysisClient> {
    Arc::new(AnalysisClient::new(provider, fast_retry(max_attempts)))
}

pub struct Harness {
    pub provider: Arc<ScriptedProvider>,
    pub store: Arc<SqliteEventStore>,
    pub pipeline: Arc<PipelineManager>,
    // Keeps the database directory alive for the test's duration.
    pub dir: TempDir,
}

impl Harness {
    pub fn new(provider: ScriptedProvider) -> Self {
        Self::with_settings(provider, PipelineSettings::default(), 3)
    }

    pub fn with_settings(provider: ScriptedProvider, settings: PipelineSettings, max_attempts: u32) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(SqliteEventStore::open(&dir.path().join("events.db")).expect("open store"));
        let provider = Arc::new(provider);
        let dyn_store: Arc<dyn EventStore> = store.clone();
        let pipeline = Arc::new(PipelineManager::new(
            client(provider.clone(), max_attempts),
            dyn_store,
            settings,
        ));
        Self {
            provider,
            store,
            pipeline,
            dir,
        }
    }
}

pub fn day(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("valid date")
}

pub fn saudi_item() -> NewsItem {
    NewsItem::new(
        "n-saudi",
        "Saudi Arabia announces additional 1 million bpd production cut",
        day("2024-06-03"),
    )
    .with_category("energy")
    .with_content("Saudi Arabia will cut crude output by a further 1 million barrels per day from July.")
}

pub fn fed_item() -> NewsItem {
    NewsItem::new(
        "n-fed",
        "Federal Reserve holds interest rates steady",
        day("2024-06-04"),
    )
    .with_category("macro")
    .with_content("The Fed left its benchmark rate unchanged and signalled patience.")
}

pub fn batch(n: usize, date: &str) -> Vec<NewsItem> {
    (0..n)
        .map(|i| {
            NewsItem::new(format!("b-{i:02}"), format!("Headline number {i}"), day(date))
                .with_content(format!("Body text for item {i} about crude exports."))
        })
        .collect()
}
