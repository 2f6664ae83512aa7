// src/fetch.rs
//! Content fetching for items that arrive without a body.
//!
//! Fetching is best-effort: any failure degrades to title-only content and never fails
//! the pipeline run.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::news::NewsItem;

/// Paragraphs this short (in chars) are navigation crumbs, captions and the like.
const MIN_PARAGRAPH_CHARS: usize = 20;
const SKIP_ANCESTORS: &[&str] = &["script", "style", "nav", "footer", "header", "aside"];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("no article text found")]
    Empty,
}

#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Return plain article text for `url`.
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

/// Plain HTTP GET + paragraph extraction.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("Mozilla/5.0 (compatible; oil-event-analyzer/0.1)")
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ContentFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let html = resp.text().await?;
        let text = extract_article_text(&html);
        if text.is_empty() {
            return Err(FetchError::Empty);
        }
        Ok(text)
    }
}

/// Where the content handed to the stages came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentSource {
    Provided,
    Fetched,
    TitleOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedContent {
    pub text: String,
    pub source: ContentSource,
}

/// Item content if present, else a fetch by URL, else the title alone.
pub async fn resolve_content(
    item: &NewsItem,
    fetcher: Option<&dyn ContentFetcher>,
    max_chars: usize,
) -> ResolvedContent {
    if item.has_content() {
        return ResolvedContent {
            text: normalize_text(&item.content, max_chars),
            source: ContentSource::Provided,
        };
    }
    if let Some(fetcher) = fetcher.filter(|_| !item.url.trim().is_empty()) {
        match fetcher.fetch(&item.url).await {
            Ok(text) => {
                let text = normalize_text(&text, max_chars);
                if !text.is_empty() {
                    debug!(news_id = %item.id, chars = text.len(), "content fetched");
                    return ResolvedContent {
                        text,
                        source: ContentSource::Fetched,
                    };
                }
            }
            Err(e) => warn!(news_id = %item.id, error = %e, "content fetch failed; using title only"),
        }
    }
    ResolvedContent {
        text: normalize_text(&item.title, max_chars),
        source: ContentSource::TitleOnly,
    }
}

// ------------------------------------------------------------
// Text extraction
// ------------------------------------------------------------

static SEL_P: Lazy<Selector> = Lazy::new(|| Selector::parse("p").expect("valid selector"));
static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)</?[^>]+>").expect("valid tag regex"));
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

/// Join `<p>` text outside of page chrome, one paragraph per line.
pub fn extract_article_text(html: &str) -> String {
    let doc = Html::parse_document(html);
    doc.select(&SEL_P)
        .filter(|p| {
            !p.ancestors()
                .filter_map(ElementRef::wrap)
                .any(|a| SKIP_ANCESTORS.contains(&a.value().name()))
        })
        .map(|p| RE_WS.replace_all(&p.text().collect::<String>(), " ").trim().to_string())
        .filter(|t| t.chars().count() > MIN_PARAGRAPH_CHARS)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Decode entities, strip stray tags, unify quotes, collapse whitespace and cap length.
pub fn normalize_text(s: &str, max_chars: usize) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();
    out = RE_TAGS.replace_all(&out, "").to_string();
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");
    out = RE_WS.replace_all(&out, " ").trim().to_string();
    if out.chars().count() > max_chars {
        out = out.chars().take(max_chars).collect();
    }
    out
}
