// src/stage/classify.rs
//! Classify: is the item oil-related, which of the 8 event types, how confident.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{clean_list, clean_opt, EventType, StageContext, StageError, StageKind};
use crate::analysis::{AnalysisSession, FieldKind, FieldSpec, PromptContext, ResponseShape};

pub(crate) const SHAPE: ResponseShape = ResponseShape::new(&[
    FieldSpec::required("is_oil_related", FieldKind::Bool),
    FieldSpec::required("event_type", FieldKind::OptionalText),
    FieldSpec::required("confidence", FieldKind::Number { min: 0.0, max: 1.0 }),
    FieldSpec::optional("keywords", FieldKind::TextList),
    FieldSpec::optional("entities", FieldKind::TextList),
    FieldSpec::optional("reason", FieldKind::OptionalText),
]);

#[derive(Debug, Deserialize)]
struct RawClassify {
    is_oil_related: bool,
    event_type: Option<String>,
    confidence: f64,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    entities: Vec<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifyResult {
    pub is_oil_related: bool,
    pub event_type: EventType,
    pub confidence: f64,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Label the model produced when it fell outside the vocabulary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unrecognized_label: Option<String>,
}

impl ClassifyResult {
    /// Gate rule: oil-related and confidence at or above the threshold (inclusive).
    pub fn passes_gate(&self, threshold: f64) -> bool {
        self.is_oil_related && self.confidence >= threshold
    }
}

fn prompt(ctx: &StageContext<'_>) -> PromptContext {
    let types = EventType::ALL
        .iter()
        .map(|t| format!("- {}: {}", t.as_str(), t.description()))
        .collect::<Vec<_>>()
        .join("\n");
    let system = format!(
        "You classify news for an oil-price risk desk. Decide whether the item is relevant \
         to crude oil prices and assign exactly one event type:\n{types}\n\
         Reply with ONLY a JSON object: {{\"is_oil_related\": bool, \"event_type\": \
         \"<type>\"|null, \"confidence\": 0..1, \"keywords\": [..], \"entities\": [..], \
         \"reason\": \"short\"}}"
    );
    PromptContext::new(system, ctx.news_block(), StageKind::Classify.temperature())
}

fn post_process(raw: RawClassify) -> ClassifyResult {
    let mut is_oil_related = raw.is_oil_related;
    let mut unrecognized_label = None;
    let event_type = match clean_opt(raw.event_type) {
        None => EventType::Other,
        Some(label) => match EventType::from_label(&label) {
            Some(t) => t,
            None => {
                // Outside the vocabulary: never stored as free text, and not trusted as relevant.
                warn!(label = %label, "unrecognized event type label");
                is_oil_related = false;
                unrecognized_label = Some(label);
                EventType::Other
            }
        },
    };
    ClassifyResult {
        is_oil_related,
        event_type,
        confidence: raw.confidence,
        keywords: clean_list(raw.keywords),
        entities: clean_list(raw.entities),
        reason: clean_opt(raw.reason),
        unrecognized_label,
    }
}

pub(crate) async fn run(
    session: &mut AnalysisSession<'_>,
    ctx: &StageContext<'_>,
) -> Result<ClassifyResult, StageError> {
    let raw: RawClassify = session.invoke(StageKind::Classify, &prompt(ctx)).await?;
    Ok(post_process(raw))
}
