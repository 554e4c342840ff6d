use serde::{Deserialize, Serialize};

/// How finely the observed price range is cut into bins.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Resolution {
    /// Fixed number of equal-width bins between min low and max high.
    BinCount(usize),
    /// Bins of one exchange tick (or a multiple), aligned to the tick grid.
    TickSize(f64),
    /// Bin width as a percentage of the mean close.
    PercentOfMean(f64),
}

impl Default for Resolution {
    fn default() -> Self {
        Resolution::PercentOfMean(0.5)
    }
}

/// How a bar's volume is attributed to price bins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionPolicy {
    /// Spread across every bin the bar's [low, high] touches, by overlap length.
    #[default]
    Proportional,
    /// Everything lands in the bin containing the close.
    Close,
}

/// Recency weighting applied on top of raw volume. The newest bar has weight 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decay {
    None,
    Exponential { half_life_days: f64 },
    Linear { window_days: f64 },
}

impl Default for Decay {
    fn default() -> Self {
        Decay::Exponential { half_life_days: 10.0 }
    }
}

impl Decay {
    pub fn weight(&self, age_days: f64) -> f64 {
        let age = age_days.max(0.0);
        match *self {
            Decay::None => 1.0,
            Decay::Exponential { half_life_days } => {
                (-std::f64::consts::LN_2 * age / half_life_days.max(1e-6)).exp()
            }
            Decay::Linear { window_days } => (1.0 - age / window_days.max(1e-6)).max(0.0),
        }
    }
}

/// One half-open price interval `[low, high)` with the volume traded inside it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceBin {
    pub low: f64,
    pub high: f64,
    /// Raw volume attributed to this bin.
    pub volume: f64,
    /// Volume after recency decay. Equals `volume` when decay is off.
    pub weighted_volume: f64,
}

/// Volume-at-price distribution for one symbol over one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChipProfile {
    pub bins: Vec<PriceBin>,
    pub bar_count: usize,
    pub total_volume: f64,
    pub total_weighted_volume: f64,
    pub min_low: f64,
    pub max_high: f64,
}

impl ChipProfile {
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// All bin boundaries, `len() + 1` values.
    pub fn edges(&self) -> Vec<f64> {
        let mut edges: Vec<f64> = self.bins.iter().map(|b| b.low).collect();
        if let Some(last) = self.bins.last() {
            edges.push(last.high);
        }
        edges
    }

    /// Index of the bin with the highest raw volume (point of control).
    pub fn point_of_control(&self) -> Option<usize> {
        self.bins
            .iter()
            .enumerate()
            .filter(|(_, b)| b.volume > 0.0)
            .max_by(|(_, a), (_, b)| a.volume.total_cmp(&b.volume))
            .map(|(i, _)| i)
    }

    pub fn max_volume(&self) -> f64 {
        self.bins.iter().map(|b| b.volume).fold(0.0, f64::max)
    }
}
