// src/analysis/client.rs
//! AnalysisClient: retry policy + structural validation around a `Provider`,
//! plus a run-scoped memo table (`AnalysisSession`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use super::error::{AnalysisError, ProviderError};
use super::provider::{Message, ModelRequest, Provider, Role};
use super::shape::{extract_json, ResponseShape};
use crate::config::RetryConfig;
use crate::stage::StageKind;

/// What a stage sends: a system preamble, the user payload and a sampling temperature.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptContext {
    pub system: String,
    pub user: String,
    pub temperature: f32,
}

impl PromptContext {
    pub fn new(system: impl Into<String>, user: impl Into<String>, temperature: f32) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            temperature,
        }
    }

    fn to_request(&self, stage: StageKind) -> ModelRequest {
        ModelRequest {
            stage,
            messages: vec![Message::system(&self.system), Message::user(&self.user)],
            temperature: self.temperature,
        }
    }

    fn memo_key(&self, stage: StageKind) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(stage.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.system.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.user.as_bytes());
        hasher.update(self.temperature.to_le_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(64);
        for b in digest.iter() {
            use std::fmt::Write as _;
            let _ = write!(&mut out, "{:02x}", b);
        }
        out
    }
}

/// Attempt budget and backoff schedule for one `invoke`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total provider calls allowed per invoke, whatever the failure kind.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound (exclusive) of the uniform jitter added to each transient backoff.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: Duration::from_millis(250),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            jitter: Duration::from_millis(cfg.jitter_ms),
        }
    }
}

impl RetryPolicy {
    /// Deterministic part of the delay after the `failed_attempt`-th (1-based) transient failure.
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let exp = failed_attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    fn jittered(&self, failed_attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..jitter_ms))
        };
        self.backoff(failed_attempt) + jitter
    }
}

enum Failure {
    Transient(String),
    Schema(String),
}

/// Shared, stateless-per-call client. Cheap to wrap in `Arc` and hand to every worker.
pub struct AnalysisClient {
    provider: Arc<dyn Provider>,
    retry: RetryPolicy,
    call_timeout: Option<Duration>,
    memoize: bool,
}

impl AnalysisClient {
    pub fn new(provider: Arc<dyn Provider>, retry: RetryPolicy) -> Self {
        Self {
            provider,
            retry,
            call_timeout: None,
            memoize: true,
        }
    }

    /// Hard cap on a single provider call; elapsing counts as a transient failure.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_memo(mut self, enabled: bool) -> Self {
        self.memoize = enabled;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Open a memo scope for one pipeline run.
    pub fn session(&self) -> AnalysisSession<'_> {
        AnalysisSession {
            client: self,
            memo: HashMap::new(),
        }
    }

    /// Un-memoized structured call: validate against the stage's shape, then decode into `T`.
    pub async fn invoke<T: DeserializeOwned>(
        &self,
        stage: StageKind,
        ctx: &PromptContext,
    ) -> Result<T, AnalysisError> {
        self.invoke_raw(stage, ctx).await.map(|(_, typed)| typed)
    }

    async fn invoke_raw<T: DeserializeOwned>(
        &self,
        stage: StageKind,
        ctx: &PromptContext,
    ) -> Result<(Value, T), AnalysisError> {
        let shape = stage.response_shape();
        let base = ctx.to_request(stage);
        let mut request = base.clone();
        let max = self.retry.max_attempts.max(1);
        let mut last = Failure::Transient("no attempt made".to_string());

        for attempt in 1..=max {
            counter!("stage_calls_total", "stage" => stage.as_str()).increment(1);
            let outcome = match self.call_timeout {
                Some(limit) => match tokio::time::timeout(limit, self.provider.complete(&request)).await {
                    Ok(r) => r,
                    Err(_) => Err(ProviderError::Transient(format!(
                        "call timed out after {}ms",
                        limit.as_millis()
                    ))),
                },
                None => self.provider.complete(&request).await,
            };

            match outcome {
                Ok(text) => match decode::<T>(&text, &shape) {
                    Ok(done) => {
                        debug!(stage = %stage, attempt, "model response accepted");
                        return Ok(done);
                    }
                    Err(msg) => {
                        warn!(stage = %stage, attempt, error = %msg, "malformed model response");
                        if attempt < max {
                            counter!("analysis_retries_total", "reason" => "schema").increment(1);
                            request = corrective_request(&base, &text, &msg, &shape);
                        }
                        last = Failure::Schema(msg);
                    }
                },
                Err(ProviderError::Transient(msg)) => {
                    warn!(stage = %stage, attempt, error = %msg, "transient model failure");
                    if attempt < max {
                        counter!("analysis_retries_total", "reason" => "transient").increment(1);
                        tokio::time::sleep(self.retry.jittered(attempt)).await;
                    }
                    last = Failure::Transient(msg);
                }
                Err(ProviderError::Rejected(message)) => {
                    warn!(stage = %stage, attempt, error = %message, "model request rejected");
                    return Err(AnalysisError::Rejected { stage, message });
                }
            }
        }

        Err(match last {
            Failure::Schema(message) => AnalysisError::Schema {
                stage,
                attempts: max,
                message,
            },
            Failure::Transient(message) => AnalysisError::Transient {
                stage,
                attempts: max,
                message,
            },
        })
    }
}

/// Run-scoped view of the client. The memo table lives and dies with one pipeline run,
/// so nothing is shared between workers.
pub struct AnalysisSession<'a> {
    client: &'a AnalysisClient,
    memo: HashMap<String, Value>,
}

impl AnalysisSession<'_> {
    pub async fn invoke<T: DeserializeOwned>(
        &mut self,
        stage: StageKind,
        ctx: &PromptContext,
    ) -> Result<T, AnalysisError> {
        if !self.client.memoize {
            return self.client.invoke(stage, ctx).await;
        }
        let key = ctx.memo_key(stage);
        if let Some(hit) = self.memo.get(&key) {
            if let Ok(typed) = serde_json::from_value::<T>(hit.clone()) {
                counter!("analysis_memo_hits_total").increment(1);
                debug!(stage = %stage, "memoized model response reused");
                return Ok(typed);
            }
        }
        let (value, typed) = self.client.invoke_raw::<T>(stage, ctx).await?;
        self.memo.insert(key, value);
        Ok(typed)
    }

    pub fn memo_len(&self) -> usize {
        self.memo.len()
    }
}

fn decode<T: DeserializeOwned>(text: &str, shape: &ResponseShape) -> Result<(Value, T), String> {
    let mut value = extract_json(text)?;
    shape.validate(&value)?;
    shape.drop_null_optionals(&mut value);
    let typed = serde_json::from_value::<T>(value.clone()).map_err(|e| e.to_string())?;
    Ok((value, typed))
}

/// Original context + the rejected reply + one corrective note. Never stacked.
fn corrective_request(
    base: &ModelRequest,
    rejected: &str,
    error: &str,
    shape: &ResponseShape,
) -> ModelRequest {
    let mut req = base.clone();
    let echoed: String = rejected.chars().take(2_000).collect();
    req.messages.push(Message {
        role: Role::Assistant,
        content: echoed,
    });
    req.messages.push(Message::user(format!(
        "Your previous reply could not be used: {error}. \
         Reply again with ONLY a JSON object with these fields: {}",
        shape.describe()
    )));
    req
}
