// src/analysis/error.rs
use thiserror::Error;

use crate::stage::StageKind;

/// Failure of a single provider round-trip, before any retry policy is applied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Network failure, timeout, rate limit or 5xx. Safe to replay verbatim.
    #[error("transient provider failure: {0}")]
    Transient(String),
    /// The provider refused the request (bad credentials, 4xx). Replaying will not help.
    #[error("provider rejected request: {0}")]
    Rejected(String),
}

/// Terminal outcome of `AnalysisClient::invoke` once the attempt budget is spent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("{stage}: transient failure after {attempts} attempt(s): {message}")]
    Transient {
        stage: StageKind,
        attempts: u32,
        message: String,
    },
    #[error("{stage}: malformed response after {attempts} attempt(s): {message}")]
    Schema {
        stage: StageKind,
        attempts: u32,
        message: String,
    },
    #[error("{stage}: request rejected: {message}")]
    Rejected { stage: StageKind, message: String },
}

impl AnalysisError {
    pub fn stage(&self) -> StageKind {
        match self {
            AnalysisError::Transient { stage, .. }
            | AnalysisError::Schema { stage, .. }
            | AnalysisError::Rejected { stage, .. } => *stage,
        }
    }

    pub fn is_schema(&self) -> bool {
        matches!(self, AnalysisError::Schema { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AnalysisError::Transient { .. })
    }
}
