use serde::{Deserialize, Serialize};

/// Label language for chart text and zone names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Zh,
    En,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneType {
    /// Strong both in the recent window and over the whole history.
    Persistent,
    /// Strong in only one of the two windows.
    ShortTerm,
    None,
}

impl ZoneType {
    /// Stable machine name, used in CSV output.
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneType::Persistent => "persistent",
            ZoneType::ShortTerm => "short_term",
            ZoneType::None => "none",
        }
    }

    pub fn label(&self, language: Language) -> &'static str {
        match (self, language) {
            (ZoneType::Persistent, Language::Zh) => "持久区",
            (ZoneType::ShortTerm, Language::Zh) => "短期区",
            (ZoneType::Persistent, Language::En) => "persistent",
            (ZoneType::ShortTerm, Language::En) => "short-term",
            (ZoneType::None, _) => "",
        }
    }

    pub fn is_zone(&self) -> bool {
        !matches!(self, ZoneType::None)
    }
}

/// Hybrid strength of one profile bin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BinStrength {
    pub recent_strength: f64,
    pub all_strength: f64,
    pub avg_strength: f64,
    pub zone_type: ZoneType,
}

/// Zone classification aligned index-for-index with a `ChipProfile`'s bins.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChipZones {
    pub strengths: Vec<BinStrength>,
    pub recent_threshold: f64,
    pub all_threshold: f64,
}

impl ChipZones {
    pub fn zone_count(&self) -> usize {
        self.strengths.iter().filter(|s| s.zone_type.is_zone()).count()
    }
}

/// Long/short accumulation strength per bar, both in [0, 1].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AccumulationSeries {
    pub long_strength: Vec<f64>,
    pub short_strength: Vec<f64>,
}
