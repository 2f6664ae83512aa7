// src/analysis/provider.rs
//! Low-level provider: one remote chat-completion round-trip, no retries, no validation.
//! Separated so the same `AnalysisClient` policy wraps production and test providers.

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::error::ProviderError;
use crate::config::ModelConfig;
use crate::stage::StageKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// A fully-built request. The stage id travels with it for logging and test doubles.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub stage: StageKind,
    pub messages: Vec<Message>,
    pub temperature: f32,
}

impl ModelRequest {
    /// Concatenated user content; handy for assertions and routing in doubles.
    pub fn user_text(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Perform the remote call and return the raw assistant text.
    async fn complete(&self, request: &ModelRequest) -> Result<String, ProviderError>;
    /// Provider name for diagnostics.
    fn name(&self) -> &'static str;
}

/// OpenAI-compatible Chat Completions provider (OpenAI, DeepSeek, local gateways).
pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiProvider {
    pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("oil-event-analyzer/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            http,
            api_key: cfg.api_key.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
        })
    }
}

#[derive(Serialize)]
struct ChatReq<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResp {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMsg,
}

#[derive(Deserialize)]
struct ChoiceMsg {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait::async_trait]
impl Provider for OpenAiProvider {
    async fn complete(&self, request: &ModelRequest) -> Result<String, ProviderError> {
        if self.api_key.is_empty() {
            return Err(ProviderError::Rejected("missing API key".to_string()));
        }

        let body = ChatReq {
            model: &self.model,
            messages: &request.messages,
            temperature: request.temperature,
        };

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(200).collect();
            return Err(classify_status(status, &snippet));
        }

        let parsed: ChatResp = resp
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("unreadable response body: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::Transient("response carried no choices".to_string()))
    }

    fn name(&self) -> &'static str {
        "openai-compatible"
    }
}

/// 408/429/5xx are worth replaying; any other non-success status is a refusal.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let msg = format!("HTTP {status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        ProviderError::Transient(msg)
    } else {
        ProviderError::Rejected(msg)
    }
}
