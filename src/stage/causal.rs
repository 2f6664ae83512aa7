// src/stage/causal.rs
//! Causal validation: checks the transmission path, looks for confounders and calibrates
//! the sentiment intensity against similar historical events.

use serde::{Deserialize, Serialize};

use super::{clean_list, clean_opt, StageContext, StageError, StageKind};
use crate::analysis::{AnalysisSession, FieldKind, FieldSpec, PromptContext, ResponseShape};

pub(crate) const SHAPE: ResponseShape = ResponseShape::new(&[
    FieldSpec::required("is_causal", FieldKind::Bool),
    FieldSpec::required("calibrated_intensity", FieldKind::Number { min: 0.0, max: 1.0 }),
    FieldSpec::required("path_completeness", FieldKind::Number { min: 0.0, max: 1.0 }),
    FieldSpec::optional("confounding_factors", FieldKind::TextList),
    FieldSpec::required("confidence", FieldKind::Number { min: 0.0, max: 1.0 }),
    FieldSpec::optional("warning", FieldKind::OptionalText),
    FieldSpec::optional("reasoning", FieldKind::OptionalText),
]);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalResult {
    pub is_causal: bool,
    pub calibrated_intensity: f64,
    pub path_completeness: f64,
    #[serde(default)]
    pub confounding_factors: Vec<String>,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// How many historical events were offered as reference.
    #[serde(default)]
    pub reference_events: usize,
}

#[derive(Debug, Deserialize)]
struct RawCausal {
    is_causal: bool,
    calibrated_intensity: f64,
    path_completeness: f64,
    #[serde(default)]
    confounding_factors: Vec<String>,
    confidence: f64,
    #[serde(default)]
    warning: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

fn prompt(ctx: &StageContext<'_>, sd: &str, sentiment: &str) -> PromptContext {
    let system = format!(
        "You are a skeptical reviewer of oil market analysis. Check whether the stated \
         transmission path really links the event to the crude price, rate how complete \
         the path is, list confounding factors and calibrate the raw intensity. Use the \
         historical events as reference points when given. Set a warning when the link \
         is weak or the score looks overstated.\n\
         Reply with ONLY a JSON object with these fields: {}",
        SHAPE.describe()
    );
    let mut user = ctx.news_block();
    user.push_str("\n\nSupply/demand analysis:\n");
    user.push_str(sd);
    user.push_str("\n\nSentiment score:\n");
    user.push_str(sentiment);
    if ctx.similar_events.is_empty() {
        user.push_str("\n\nHistorical events: none on record");
    } else {
        user.push_str("\n\nHistorical events of the same type:");
        for ev in ctx.similar_events {
            user.push_str(&format!(
                "\n- {} | {} | intensity {} | polarity {}",
                ev.event_date,
                ev.title,
                ev.calibrated_intensity
                    .map(|v| format!("{v:.2}"))
                    .unwrap_or_else(|| "n/a".into()),
                ev.polarity
                    .map(|v| format!("{v:.2}"))
                    .unwrap_or_else(|| "n/a".into()),
            ));
        }
    }
    PromptContext::new(system, user, StageKind::CausalValidate.temperature())
}

pub(crate) async fn run(
    session: &mut AnalysisSession<'_>,
    ctx: &StageContext<'_>,
) -> Result<CausalResult, StageError> {
    let stage = StageKind::CausalValidate;
    let sd = ctx.supply_demand.ok_or(StageError::MissingInput {
        stage,
        input: "supply_demand",
    })?;
    let sentiment = ctx.sentiment.ok_or(StageError::MissingInput {
        stage,
        input: "sentiment",
    })?;
    let sd = serde_json::to_string(sd).unwrap_or_default();
    let sentiment = serde_json::to_string(sentiment).unwrap_or_default();

    let raw: RawCausal = session.invoke(stage, &prompt(ctx, &sd, &sentiment)).await?;
    Ok(CausalResult {
        is_causal: raw.is_causal,
        calibrated_intensity: raw.calibrated_intensity,
        path_completeness: raw.path_completeness,
        confounding_factors: clean_list(raw.confounding_factors),
        confidence: raw.confidence,
        warning: clean_opt(raw.warning),
        reasoning: clean_opt(raw.reasoning),
        reference_events: ctx.similar_events.len(),
    })
}
