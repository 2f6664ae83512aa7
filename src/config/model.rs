// src/config/model.rs
use serde::{Deserialize, Serialize};
use std::env;

use super::ENV_LLM_API_KEY;

fn default_base_url() -> String {
    "https://api.deepseek.com/v1".to_string()
}
fn default_model() -> String {
    "deepseek-chat".to_string()
}
fn default_api_key() -> String {
    "ENV".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}

/// Model endpoint settings. Works with any OpenAI-compatible chat completions API.
#[derive(Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// "ENV" means: read from LLM_API_KEY.
    #[serde(default = "default_api_key", skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: default_api_key(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

// Never print the key itself.
impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key_len", &self.api_key.len())
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl ModelConfig {
    /// Replace an "ENV" placeholder with `$LLM_API_KEY`. A missing variable leaves the key
    /// empty; the provider then rejects calls instead of the process refusing to start.
    pub fn resolve_api_key(&mut self) {
        if self.api_key.trim().eq_ignore_ascii_case("env") {
            self.api_key = env::var(ENV_LLM_API_KEY).unwrap_or_default();
        }
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty() && !self.api_key.trim().eq_ignore_ascii_case("env")
    }

    pub(super) fn sanitize(&mut self) {
        self.base_url = self.base_url.trim().trim_end_matches('/').to_string();
        if self.base_url.is_empty() {
            self.base_url = default_base_url();
        }
        if self.model.trim().is_empty() {
            self.model = default_model();
        }
        if self.timeout_secs == 0 {
            self.timeout_secs = default_timeout_secs();
        }
    }
}
