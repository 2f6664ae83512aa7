// src/stage/supply_demand.rs
//! Supply/demand analysis: which drivers move, the entities involved, rough
//! quantitative impacts and the transmission path from event to price.

use serde::{Deserialize, Serialize};

use super::{clean_list, clean_opt, StageContext, StageError, StageKind};
use crate::analysis::{AnalysisSession, FieldKind, FieldSpec, PromptContext, ResponseShape};

const DRIVER_LABELS: &[&str] = &["supply", "demand", "financial"];
const HORIZON_LABELS: &[&str] = &["short", "medium", "long"];

const INDICATORS: &[FieldSpec] = &[
    FieldSpec::optional("supply_change_pct", FieldKind::OptionalNumber),
    FieldSpec::optional("demand_change_pct", FieldKind::OptionalNumber),
    FieldSpec::optional("inventory_change_mb", FieldKind::OptionalNumber),
    FieldSpec::optional("price_impact_pct", FieldKind::OptionalNumber),
    FieldSpec::optional("time_horizon", FieldKind::OneOf(HORIZON_LABELS)),
];

pub(crate) const SHAPE: ResponseShape = ResponseShape::new(&[
    FieldSpec::required("drivers", FieldKind::TextList),
    FieldSpec::required("key_entities", FieldKind::TextList),
    FieldSpec::optional("quantitative_indicators", FieldKind::Object(INDICATORS)),
    FieldSpec::required("transmission_path", FieldKind::TextOrTextList),
    FieldSpec::required("confidence", FieldKind::Number { min: 0.0, max: 1.0 }),
    FieldSpec::optional("uncertainties", FieldKind::TextList),
    FieldSpec::optional("reasoning", FieldKind::OptionalText),
]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Driver {
    Supply,
    Demand,
    Financial,
}

impl Driver {
    fn from_label(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "supply" | "supply_side" => Some(Driver::Supply),
            "demand" | "demand_side" => Some(Driver::Demand),
            "financial" | "finance" | "financial_flows" => Some(Driver::Financial),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeHorizon {
    Short,
    Medium,
    Long,
}

impl TimeHorizon {
    fn from_label(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "short" => Some(TimeHorizon::Short),
            "medium" => Some(TimeHorizon::Medium),
            "long" => Some(TimeHorizon::Long),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuantIndicators {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supply_change_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub demand_change_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory_change_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_impact_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_horizon: Option<TimeHorizon>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplyDemandResult {
    pub drivers: Vec<Driver>,
    pub key_entities: Vec<String>,
    #[serde(default)]
    pub quantitative_indicators: QuantIndicators,
    /// Ordered hops from the event to the price.
    pub transmission_path: Vec<String>,
    pub confidence: f64,
    #[serde(default)]
    pub uncertainties: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PathRepr {
    Joined(String),
    Hops(Vec<String>),
}

#[derive(Debug, Default, Deserialize)]
struct RawIndicators {
    supply_change_pct: Option<f64>,
    demand_change_pct: Option<f64>,
    inventory_change_mb: Option<f64>,
    price_impact_pct: Option<f64>,
    time_horizon: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSupplyDemand {
    drivers: Vec<String>,
    key_entities: Vec<String>,
    #[serde(default)]
    quantitative_indicators: Option<RawIndicators>,
    transmission_path: PathRepr,
    confidence: f64,
    #[serde(default)]
    uncertainties: Vec<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Split "A → B -> C" (or a list that may itself hold joined hops) into ordered hops.
fn split_path(path: PathRepr) -> Vec<String> {
    let joined = match path {
        PathRepr::Joined(s) => vec![s],
        PathRepr::Hops(v) => v,
    };
    let hops = joined
        .iter()
        .flat_map(|s| s.split(['→', '⇒']).flat_map(|p| p.split("->")))
        .map(str::to_string)
        .collect();
    clean_list(hops)
}

fn prompt(ctx: &StageContext<'_>) -> PromptContext {
    let system = format!(
        "You are an oil market analyst. Break the news down by supply/demand fundamentals. \
         Drivers are any of [{drivers}]. Give the transmission path as ordered hops from the \
         event to the crude price. Quantities are rough estimates or null when unknown; \
         time_horizon is one of [{horizons}].\n\
         Reply with ONLY a JSON object with these fields: {shape}",
        drivers = DRIVER_LABELS.join(", "),
        horizons = HORIZON_LABELS.join(", "),
        shape = SHAPE.describe(),
    );
    let mut user = ctx.news_block();
    if let Some(c) = ctx.classification {
        user.push_str(&format!(
            "\n\nClassified as: {} (confidence {:.2})",
            c.event_type, c.confidence
        ));
    }
    PromptContext::new(system, user, StageKind::SupplyDemandAnalyze.temperature())
}

fn post_process(raw: RawSupplyDemand) -> SupplyDemandResult {
    let mut drivers: Vec<Driver> = Vec::new();
    for d in raw.drivers.iter().filter_map(|s| Driver::from_label(s)) {
        if !drivers.contains(&d) {
            drivers.push(d);
        }
    }
    let ind = raw.quantitative_indicators.unwrap_or_default();
    SupplyDemandResult {
        drivers,
        key_entities: clean_list(raw.key_entities),
        quantitative_indicators: QuantIndicators {
            supply_change_pct: ind.supply_change_pct,
            demand_change_pct: ind.demand_change_pct,
            inventory_change_mb: ind.inventory_change_mb,
            price_impact_pct: ind.price_impact_pct,
            time_horizon: ind.time_horizon.as_deref().and_then(TimeHorizon::from_label),
        },
        transmission_path: split_path(raw.transmission_path),
        confidence: raw.confidence,
        uncertainties: clean_list(raw.uncertainties),
        reasoning: clean_opt(raw.reasoning),
    }
}

pub(crate) async fn run(
    session: &mut AnalysisSession<'_>,
    ctx: &StageContext<'_>,
) -> Result<SupplyDemandResult, StageError> {
    let raw: RawSupplyDemand = session
        .invoke(StageKind::SupplyDemandAnalyze, &prompt(ctx))
        .await?;
    Ok(post_process(raw))
}
