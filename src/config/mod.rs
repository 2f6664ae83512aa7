// src/config/mod.rs
//! Pipeline configuration: an explicit value handed to the scheduler and pipeline,
//! loaded from TOML/JSON with environment overrides.

pub mod model;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub use model::ModelConfig;

pub const ENV_CONFIG_PATH: &str = "PIPELINE_CONFIG_PATH";
pub const ENV_LLM_API_KEY: &str = "LLM_API_KEY";
pub const ENV_LLM_BASE_URL: &str = "LLM_BASE_URL";
pub const ENV_LLM_MODEL: &str = "LLM_MODEL";
pub const ENV_THRESHOLD: &str = "CLASSIFY_CONFIDENCE_THRESHOLD";
pub const ENV_MAX_WORKERS: &str = "MAX_WORKERS";
pub const ENV_PARALLEL: &str = "PARALLEL_ENABLED";
pub const ENV_DATABASE_PATH: &str = "DATABASE_PATH";

pub const DEFAULT_CLASSIFY_CONFIDENCE_THRESHOLD: f64 = 0.6;
pub const DEFAULT_MAX_WORKERS: usize = 5;
/// Longest look-back window accepted anywhere a day count is configured or requested.
pub const MAX_DAYS_BACK: u32 = 3650;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter_ms: 250,
        }
    }
}

/// Window used by the daily summary job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    pub days_back: u32,
    pub max_events: usize,
    pub top_n: usize,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            days_back: 7,
            max_events: 50,
            top_n: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub model: ModelConfig,
    pub retry: RetryConfig,
    /// Classify confidence at or above this value passes the gate (inclusive).
    pub classify_confidence_threshold: f64,
    pub max_workers: usize,
    /// When false the scheduler runs one item at a time.
    pub parallel: bool,
    pub memoize_responses: bool,
    pub max_content_chars: usize,
    pub fetch_timeout_secs: u64,
    pub similar_events_days: u32,
    pub similar_events_limit: usize,
    pub database_path: PathBuf,
    /// Optional overall batch deadline; undispatched items are left unprocessed.
    pub deadline_secs: Option<u64>,
    pub summary: SummaryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            retry: RetryConfig::default(),
            classify_confidence_threshold: DEFAULT_CLASSIFY_CONFIDENCE_THRESHOLD,
            max_workers: DEFAULT_MAX_WORKERS,
            parallel: true,
            memoize_responses: true,
            max_content_chars: 20_000,
            fetch_timeout_secs: 10,
            similar_events_days: 30,
            similar_events_limit: 5,
            database_path: PathBuf::from("data/text_factor.db"),
            deadline_secs: None,
            summary: SummaryConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from an explicit path. Supports TOML or JSON (by extension, then by content).
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let mut cfg = parse_config(&content, &ext)
            .with_context(|| format!("parsing pipeline config {}", path.display()))?;
        cfg.finish();
        Ok(cfg)
    }

    /// Load using env var + fallbacks:
    /// 1) $PIPELINE_CONFIG_PATH
    /// 2) config/pipeline.toml
    /// 3) config/pipeline.json
    /// 4) built-in defaults
    ///
    /// Environment overrides are applied on top in every case.
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
            }
            return Self::load_from(&pb);
        }
        for candidate in ["config/pipeline.toml", "config/pipeline.json"] {
            let pb = PathBuf::from(candidate);
            if pb.exists() {
                return Self::load_from(&pb);
            }
        }
        let mut cfg = Self::default();
        cfg.finish();
        Ok(cfg)
    }

    /// Worker bound actually used by the scheduler.
    pub fn effective_workers(&self) -> usize {
        if self.parallel {
            self.max_workers.max(1)
        } else {
            1
        }
    }

    fn finish(&mut self) {
        self.apply_env_overrides();
        self.model.resolve_api_key();
        self.sanitize();
    }

    fn apply_env_overrides(&mut self) {
        use std::env::var;
        if let Ok(v) = var(ENV_LLM_API_KEY) {
            if !v.trim().is_empty() {
                self.model.api_key = v;
            }
        }
        if let Ok(v) = var(ENV_LLM_BASE_URL) {
            self.model.base_url = v;
        }
        if let Ok(v) = var(ENV_LLM_MODEL) {
            self.model.model = v;
        }
        if let Some(v) = var(ENV_THRESHOLD).ok().and_then(|s| s.trim().parse::<f64>().ok()) {
            self.classify_confidence_threshold = v;
        }
        if let Some(v) = var(ENV_MAX_WORKERS).ok().and_then(|s| s.trim().parse::<usize>().ok()) {
            self.max_workers = v;
        }
        if let Some(v) = var(ENV_PARALLEL).ok().and_then(|s| parse_bool(&s)) {
            self.parallel = v;
        }
        if let Ok(v) = var(ENV_DATABASE_PATH) {
            if !v.trim().is_empty() {
                self.database_path = PathBuf::from(v);
            }
        }
    }

    fn sanitize(&mut self) {
        if !self.classify_confidence_threshold.is_finite() {
            self.classify_confidence_threshold = DEFAULT_CLASSIFY_CONFIDENCE_THRESHOLD;
        }
        self.classify_confidence_threshold = self.classify_confidence_threshold.clamp(0.0, 1.0);
        self.max_workers = self.max_workers.max(1);
        self.retry.max_attempts = self.retry.max_attempts.max(1);
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            self.retry.max_delay_ms = self.retry.base_delay_ms;
        }
        self.max_content_chars = self.max_content_chars.max(200);
        self.summary.top_n = self.summary.top_n.max(1);
        self.summary.max_events = self.summary.max_events.max(1);
        self.summary.days_back = self.summary.days_back.min(MAX_DAYS_BACK);
        self.similar_events_days = self.similar_events_days.min(MAX_DAYS_BACK);
        self.model.sanitize();
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_config(s: &str, hint_ext: &str) -> Result<PipelineConfig> {
    if hint_ext == "json" || (hint_ext != "toml" && s.trim_start().starts_with('{')) {
        return Ok(serde_json::from_str(s)?);
    }
    Ok(toml::from_str(s)?)
}
