// src/news.rs
//! Input items and the JSON news-list loader.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::warn;

/// One news item. Immutable once loaded; `content` may be empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsItem {
    pub id: String,
    pub title: String,
    pub published_at: NaiveDate,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub content: String,
}

impl NewsItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>, published_at: NaiveDate) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            published_at,
            category: String::new(),
            url: String::new(),
            content: String::new(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn has_content(&self) -> bool {
        !self.content.trim().is_empty()
    }
}

// ------------------------------------------------------------
// Loader
// ------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawItem {
    id: Value,
    title: String,
    #[serde(default, alias = "published_at")]
    date: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

/// Accepts `YYYY-MM-DD`, `YYYY/MM/DD` and RFC 3339 timestamps.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y/%m/%d"))
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive()))
}

fn id_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn is_http_url(url: &str) -> bool {
    let u = url.trim().to_ascii_lowercase();
    u.starts_with("http://") || u.starts_with("https://")
}

/// Parse a JSON array of items. Rows with a bad id, an unparseable date or a
/// non-http(s) URL are skipped with a warning; an empty URL is allowed.
pub fn parse_news_json(s: &str) -> Result<Vec<NewsItem>> {
    let rows: Vec<RawItem> = serde_json::from_str(s).context("news list must be a JSON array")?;
    let mut out = Vec::with_capacity(rows.len());
    for (idx, row) in rows.into_iter().enumerate() {
        let Some(id) = id_string(&row.id) else {
            warn!(row = idx, "skipping news row without a usable id");
            continue;
        };
        let Some(published_at) = row.date.as_deref().and_then(parse_date) else {
            warn!(row = idx, news_id = %id, "skipping news row with missing or invalid date");
            continue;
        };
        let url = row.url.unwrap_or_default().trim().to_string();
        if !url.is_empty() && !is_http_url(&url) {
            warn!(row = idx, news_id = %id, "skipping news row with non-http url");
            continue;
        }
        out.push(NewsItem {
            id,
            title: row.title.trim().to_string(),
            published_at,
            category: row.category.unwrap_or_default().trim().to_string(),
            url,
            content: row.content.unwrap_or_default(),
        });
    }
    Ok(out)
}

pub fn load_news(path: &Path) -> Result<Vec<NewsItem>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading news list from {}", path.display()))?;
    parse_news_json(&content).with_context(|| format!("parsing news list {}", path.display()))
}
