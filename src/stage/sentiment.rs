// src/stage/sentiment.rs
//! Sentiment: direction and strength of the expected price impact.
//! polarity in [-1, 1] (bearish .. bullish for crude), intensity and confidence in [0, 1].

use serde::{Deserialize, Serialize};

use super::{clean_opt, StageContext, StageError, StageKind};
use crate::analysis::{AnalysisSession, FieldKind, FieldSpec, PromptContext, ResponseShape};

pub(crate) const SHAPE: ResponseShape = ResponseShape::new(&[
    FieldSpec::required("polarity", FieldKind::Number { min: -1.0, max: 1.0 }),
    FieldSpec::required("intensity", FieldKind::Number { min: 0.0, max: 1.0 }),
    FieldSpec::required("confidence", FieldKind::Number { min: 0.0, max: 1.0 }),
    FieldSpec::optional("basis", FieldKind::OptionalText),
]);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentResult {
    pub polarity: f64,
    /// Raw intensity as scored. Calibration never overwrites it.
    pub intensity: f64,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basis: Option<String>,
}

impl SentimentResult {
    pub fn label(&self) -> &'static str {
        if self.polarity > 0.1 {
            "bullish"
        } else if self.polarity < -0.1 {
            "bearish"
        } else {
            "neutral"
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawSentiment {
    polarity: f64,
    intensity: f64,
    confidence: f64,
    #[serde(default)]
    basis: Option<String>,
}

fn prompt(ctx: &StageContext<'_>) -> PromptContext {
    let system = format!(
        "You score the crude oil price impact of a news item. polarity: -1 strongly bearish, \
         0 neutral, 1 strongly bullish. intensity: 0 negligible, 1 extreme market-moving. \
         confidence: how sure you are of the score. basis: one or two sentences.\n\
         Reply with ONLY a JSON object with these fields: {}",
        SHAPE.describe()
    );
    let mut user = ctx.news_block();
    if let Some(sd) = ctx.supply_demand {
        user.push_str("\n\nSupply/demand analysis:\n");
        user.push_str(&serde_json::to_string(sd).unwrap_or_default());
    }
    PromptContext::new(system, user, StageKind::SentimentScore.temperature())
}

pub(crate) async fn run(
    session: &mut AnalysisSession<'_>,
    ctx: &StageContext<'_>,
) -> Result<SentimentResult, StageError> {
    let raw: RawSentiment = session.invoke(StageKind::SentimentScore, &prompt(ctx)).await?;
    Ok(SentimentResult {
        polarity: raw.polarity,
        intensity: raw.intensity,
        confidence: raw.confidence,
        basis: clean_opt(raw.basis),
    })
}
