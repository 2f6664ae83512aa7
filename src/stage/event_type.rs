// src/stage/event_type.rs
//! Fixed 8-value event vocabulary. Model labels are normalized into it, never stored raw.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Geopolitical,
    Macro,
    Sentiment,
    Weather,
    Inventory,
    Policy,
    Technology,
    Other,
}

impl EventType {
    pub const ALL: [EventType; 8] = [
        EventType::Geopolitical,
        EventType::Macro,
        EventType::Sentiment,
        EventType::Weather,
        EventType::Inventory,
        EventType::Policy,
        EventType::Technology,
        EventType::Other,
    ];

    pub const LABELS: &'static [&'static str] = &[
        "geopolitical",
        "macro",
        "sentiment",
        "weather",
        "inventory",
        "policy",
        "technology",
        "other",
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Geopolitical => "geopolitical",
            EventType::Macro => "macro",
            EventType::Sentiment => "sentiment",
            EventType::Weather => "weather",
            EventType::Inventory => "inventory",
            EventType::Policy => "policy",
            EventType::Technology => "technology",
            EventType::Other => "other",
        }
    }

    /// One-line description used in the classification prompt.
    pub fn description(&self) -> &'static str {
        match self {
            EventType::Geopolitical => "war, conflict, sanctions, OPEC decisions, attacks on infrastructure",
            EventType::Macro => "GDP, interest rates, PMI, employment, inflation, FX, recession",
            EventType::Sentiment => "panic, speculation, positioning, bullish/bearish expectations",
            EventType::Weather => "hurricanes, cold snaps, floods, refinery outages",
            EventType::Inventory => "crude/product stocks, EIA/API data, strategic reserve releases",
            EventType::Policy => "energy policy, taxes, export quotas, tariffs, regulation",
            EventType::Technology => "extraction or refining technology, recovery-rate gains",
            EventType::Other => "substitutes, fundamentals, trade friction, energy transition",
        }
    }

    /// Normalize a free-form label. Returns `None` for anything outside the vocabulary.
    pub fn from_label(raw: &str) -> Option<Self> {
        let norm: String = raw
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c == '-' || c == ' ' { '_' } else { c })
            .collect();
        let t = match norm.as_str() {
            "geopolitical" | "geopolitics" | "geo_political" => EventType::Geopolitical,
            "macro" | "macroeconomic" | "macro_economic" | "macroeconomy" => EventType::Macro,
            "sentiment" | "market_sentiment" => EventType::Sentiment,
            "weather" | "extreme_weather" => EventType::Weather,
            "inventory" | "inventories" | "stocks" => EventType::Inventory,
            "policy" | "regulation" => EventType::Policy,
            "technology" | "tech" => EventType::Technology,
            "other" => EventType::Other,
            _ => return None,
        };
        Some(t)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::from_label(s).ok_or_else(|| format!("unknown event type: {s}"))
    }
}
