// src/analysis/mod.rs
//! Model access: provider abstraction, retrying/validating client, response shapes.

pub mod client;
pub mod error;
pub mod provider;
pub mod shape;

pub use client::{AnalysisClient, AnalysisSession, PromptContext, RetryPolicy};
pub use error::{AnalysisError, ProviderError};
pub use provider::{Message, ModelRequest, OpenAiProvider, Provider, Role};
pub use shape::{extract_json, FieldKind, FieldSpec, ResponseShape};
