use tracing::{debug, warn};

use crate::config::AnalysisConfig;
use crate::errors::PipelineError;
use crate::models::{Bar, ChipProfile, Decay, DistributionPolicy, PriceBin, Resolution};

/// Upper bound on bins; finer resolutions are coarsened to fit.
pub const MAX_BINS: usize = 2000;

/// Largest tick index representable exactly in an `f64` (2^53).
const MAX_TICK_INDEX: f64 = 9_007_199_254_740_992.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfileParams {
    pub resolution: Resolution,
    pub distribution: DistributionPolicy,
    pub decay: Decay,
    pub min_bars: usize,
}

impl Default for ProfileParams {
    fn default() -> Self {
        Self {
            resolution: Resolution::default(),
            distribution: DistributionPolicy::default(),
            decay: Decay::default(),
            min_bars: 2,
        }
    }
}

impl From<&AnalysisConfig> for ProfileParams {
    fn from(config: &AnalysisConfig) -> Self {
        Self {
            resolution: config.resolution,
            distribution: config.distribution,
            decay: config.decay,
            min_bars: config.min_bars,
        }
    }
}

/// Build the volume-at-price profile of an ordered bar series.
pub fn build_profile(bars: &[Bar], params: &ProfileParams) -> Result<ChipProfile, PipelineError> {
    validate_series(bars, params.min_bars)?;

    let (min_low, max_high) = price_range(bars);
    let mean_close = bars.iter().map(|b| b.close).sum::<f64>() / bars.len() as f64;
    let edges = bin_edges(min_low, max_high, params.resolution, mean_close)?;

    let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();
    let weights = decay_weights(bars, params.decay);
    let weighted: Vec<f64> = volumes.iter().zip(&weights).map(|(v, w)| v * w).collect();

    let raw_bins = distribute(bars, &edges, params.distribution, &volumes);
    let weighted_bins = distribute(bars, &edges, params.distribution, &weighted);

    let bins: Vec<PriceBin> = edges
        .windows(2)
        .zip(raw_bins.iter().zip(&weighted_bins))
        .map(|(e, (&volume, &weighted_volume))| PriceBin {
            low: e[0],
            high: e[1],
            volume,
            weighted_volume,
        })
        .collect();

    debug!(
        "Built profile: {} bars -> {} bins over [{}, {}]",
        bars.len(),
        bins.len(),
        min_low,
        max_high
    );

    Ok(ChipProfile {
        bins,
        bar_count: bars.len(),
        total_volume: volumes.iter().sum(),
        total_weighted_volume: weighted.iter().sum(),
        min_low,
        max_high,
    })
}

/// Reject series the aggregator cannot bin.
pub fn validate_series(bars: &[Bar], min_bars: usize) -> Result<(), PipelineError> {
    if bars.len() < min_bars.max(1) {
        return Err(PipelineError::InsufficientData(format!(
            "{} bar(s), at least {} required",
            bars.len(),
            min_bars
        )));
    }

    if let Some(pair) = bars.windows(2).find(|w| w[1].timestamp <= w[0].timestamp) {
        return Err(PipelineError::InsufficientData(format!(
            "timestamps not strictly increasing at {}",
            pair[1].timestamp
        )));
    }

    if let Some(bar) = bars.iter().find(|b| !b.is_finite() || b.volume < 0.0) {
        return Err(PipelineError::InsufficientData(format!(
            "invalid values in bar at {}",
            bar.timestamp
        )));
    }
    Ok(())
}

/// `(min low, max high)` over all bars, zero-volume bars included.
pub fn price_range(bars: &[Bar]) -> (f64, f64) {
    bars.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), bar| {
        let (l, h) = bar.range();
        (lo.min(l), hi.max(h))
    })
}

/// Deterministic bin boundaries covering `[min_low, max_high]`.
///
/// Tick-size edges sit on integer multiples of the tick. The last edge is
/// never below `max_high`.
pub fn bin_edges(
    min_low: f64,
    max_high: f64,
    resolution: Resolution,
    mean_close: f64,
) -> Result<Vec<f64>, PipelineError> {
    let span = max_high - min_low;
    if !(span.is_finite() && span > 0.0) {
        return Err(PipelineError::InsufficientData(format!(
            "flat price range at {}",
            min_low
        )));
    }

    let edges = match resolution {
        Resolution::BinCount(count) => {
            let count = count.min(MAX_BINS);
            let width = span / count as f64;
            let mut edges: Vec<f64> = (0..count).map(|i| min_low + i as f64 * width).collect();
            edges.push(max_high);
            edges
        }
        Resolution::TickSize(tick) => {
            let first = (min_low / tick).floor();
            let last = (max_high / tick).ceil().max(first + 1.0);
            // Tick indices must stay exact integers.
            if !(first.abs() <= MAX_TICK_INDEX && last.abs() <= MAX_TICK_INDEX) {
                return Err(PipelineError::InsufficientData(format!(
                    "tick size {} is too fine for prices up to {}",
                    tick, max_high
                )));
            }
            let (first, last) = (first as i64, last as i64);
            let step = coarsen_step((last - first) as usize);
            if step > 1 {
                warn!("Tick size {} yields too many bins, using {} ticks per bin", tick, step);
            }
            let step = step as i64;
            let mut edges = Vec::new();
            let mut k = first;
            loop {
                edges.push(k as f64 * tick);
                if k >= last {
                    break;
                }
                k += step;
            }
            edges
        }
        Resolution::PercentOfMean(pct) => {
            let width = (mean_close.abs() * pct / 100.0).max(1e-6);
            let count = (span / width).ceil() as usize;
            let step = coarsen_step(count) as f64;
            let width = width * step;
            let count = (span / width).ceil().max(1.0) as usize;
            (0..=count).map(|i| min_low + i as f64 * width).collect()
        }
    };

    let mut edges = edges;
    // Floating point accumulation can land a hair under the top.
    if let Some(&top) = edges.last() {
        if top < max_high {
            let width = edges[edges.len() - 1] - edges[edges.len().saturating_sub(2)];
            edges.push(top + width.max(f64::EPSILON * max_high.abs()));
        }
    }

    let bins = edges.len().saturating_sub(1);
    if bins < 2 {
        return Err(PipelineError::InsufficientData(format!(
            "resolution {:?} yields {} bin(s) over [{}, {}]",
            resolution, bins, min_low, max_high
        )));
    }
    Ok(edges)
}

fn coarsen_step(count: usize) -> usize {
    if count > MAX_BINS {
        count.div_ceil(MAX_BINS)
    } else {
        1
    }
}

/// Index of the bin containing `price`. Prices outside the edges clamp to the ends.
pub fn bin_index(edges: &[f64], price: f64) -> usize {
    let bins = edges.len().saturating_sub(1);
    if bins == 0 {
        return 0;
    }
    edges
        .partition_point(|&e| e <= price)
        .saturating_sub(1)
        .min(bins - 1)
}

/// Spread one value per bar over the bins, according to `policy`.
///
/// The returned totals sum to the sum of `amounts` (up to rounding).
pub fn distribute(bars: &[Bar], edges: &[f64], policy: DistributionPolicy, amounts: &[f64]) -> Vec<f64> {
    let mut totals = vec![0.0; edges.len().saturating_sub(1)];
    if totals.is_empty() {
        return totals;
    }

    for (bar, &amount) in bars.iter().zip(amounts) {
        if amount == 0.0 {
            continue;
        }
        match policy {
            DistributionPolicy::Close => totals[bin_index(edges, bar.close)] += amount,
            DistributionPolicy::Proportional => {
                let (lo, hi) = bar.range();
                let first = bin_index(edges, lo);
                if hi <= lo {
                    totals[first] += amount;
                    continue;
                }
                let last = bin_index(edges, hi);
                let span = hi - lo;
                for (i, total) in totals.iter_mut().enumerate().take(last + 1).skip(first) {
                    let overlap = hi.min(edges[i + 1]) - lo.max(edges[i]);
                    if overlap > 0.0 {
                        *total += amount * overlap / span;
                    }
                }
            }
        }
    }
    totals
}

/// Bar age in days, measured back from the newest bar.
pub fn age_days(bars: &[Bar]) -> Vec<f64> {
    let Some(newest) = bars.iter().map(|b| b.timestamp).max() else {
        return Vec::new();
    };
    bars.iter()
        .map(|b| (newest - b.timestamp).num_seconds() as f64 / 86_400.0)
        .collect()
}

pub fn decay_weights(bars: &[Bar], decay: Decay) -> Vec<f64> {
    age_days(bars).into_iter().map(|age| decay.weight(age)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, NaiveDateTime};

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 9, 3).unwrap().and_hms_opt(9, 0, 0).unwrap()
    }

    fn bar(i: i64, low: f64, high: f64, close: f64, volume: f64) -> Bar {
        Bar {
            timestamp: start() + Duration::hours(i),
            open: close,
            high,
            low,
            close,
            volume,
            open_interest: None,
        }
    }

    fn series() -> Vec<Bar> {
        vec![
            bar(0, 100.0, 104.0, 103.0, 1200.0),
            bar(1, 102.5, 107.0, 106.0, 800.0),
            bar(2, 105.0, 105.0, 105.0, 300.0),
            bar(3, 101.0, 103.3, 101.5, 0.0),
            bar(4, 99.0, 102.0, 100.2, 2500.0),
        ]
    }

    fn no_decay(resolution: Resolution) -> ProfileParams {
        ProfileParams {
            resolution,
            decay: Decay::None,
            ..ProfileParams::default()
        }
    }

    #[test]
    fn test_volume_is_conserved_without_decay() {
        for resolution in [
            Resolution::BinCount(7),
            Resolution::TickSize(0.5),
            Resolution::PercentOfMean(0.5),
        ] {
            for distribution in [DistributionPolicy::Proportional, DistributionPolicy::Close] {
                let params = ProfileParams {
                    distribution,
                    ..no_decay(resolution)
                };
                let profile = build_profile(&series(), &params).unwrap();
                let binned: f64 = profile.bins.iter().map(|b| b.volume).sum();
                assert!((binned - 4800.0).abs() < 1e-6, "{:?} {:?}: {}", resolution, distribution, binned);
                assert!((profile.total_weighted_volume - profile.total_volume).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_profile_is_deterministic() {
        let params = ProfileParams::default();
        let a = build_profile(&series(), &params).unwrap();
        let b = build_profile(&series(), &params).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.edges(), b.edges());
    }

    #[test]
    fn test_edges_cover_price_range() {
        let profile = build_profile(&series(), &no_decay(Resolution::PercentOfMean(0.5))).unwrap();
        assert_eq!(profile.bins[0].low, 99.0);
        assert!(profile.bins.last().unwrap().high >= 107.0);
        for pair in profile.bins.windows(2) {
            assert_eq!(pair[0].high, pair[1].low);
        }
    }

    #[test]
    fn test_tick_edges_are_grid_aligned() {
        let edges = bin_edges(99.3, 101.1, Resolution::TickSize(0.5), 100.0).unwrap();
        assert_eq!(edges, vec![99.0, 99.5, 100.0, 100.5, 101.0, 101.5]);
    }

    #[test]
    fn test_too_fine_tick_is_insufficient_data() {
        let err = bin_edges(1000.0, 1010.0, Resolution::TickSize(1e-17), 1005.0).unwrap_err();
        assert!(matches!(err, PipelineError::InsufficientData(_)));

        // Fine but representable ticks are coarsened instead.
        let edges = bin_edges(1000.0, 1010.0, Resolution::TickSize(1e-9), 1005.0).unwrap();
        assert!(edges.len() <= MAX_BINS + 2);
        assert!(*edges.last().unwrap() >= 1010.0);
    }

    #[test]
    fn test_bin_count_edges() {
        let edges = bin_edges(10.0, 20.0, Resolution::BinCount(4), 15.0).unwrap();
        assert_eq!(edges, vec![10.0, 12.5, 15.0, 17.5, 20.0]);
    }

    #[test]
    fn test_insufficient_data() {
        let one = vec![bar(0, 100.0, 101.0, 100.5, 10.0)];
        assert!(matches!(
            build_profile(&one, &ProfileParams::default()),
            Err(PipelineError::InsufficientData(_))
        ));
        assert!(matches!(
            build_profile(&[], &ProfileParams::default()),
            Err(PipelineError::InsufficientData(_))
        ));

        let flat = vec![bar(0, 100.0, 100.0, 100.0, 5.0), bar(1, 100.0, 100.0, 100.0, 5.0)];
        assert!(matches!(
            build_profile(&flat, &ProfileParams::default()),
            Err(PipelineError::InsufficientData(_))
        ));

        // A single bin cannot describe a distribution.
        let coarse = no_decay(Resolution::PercentOfMean(50.0));
        assert!(matches!(
            build_profile(&series(), &coarse),
            Err(PipelineError::InsufficientData(_))
        ));
    }

    #[test]
    fn test_rejects_unordered_and_duplicate_timestamps() {
        let mut bars = series();
        bars.swap(1, 2);
        assert!(matches!(
            build_profile(&bars, &ProfileParams::default()),
            Err(PipelineError::InsufficientData(_))
        ));

        let mut bars = series();
        bars[2].timestamp = bars[1].timestamp;
        assert!(build_profile(&bars, &ProfileParams::default()).is_err());
    }

    #[test]
    fn test_proportional_split_by_overlap() {
        let bars = vec![bar(0, 10.0, 14.0, 12.0, 100.0), bar(1, 10.0, 20.0, 15.0, 0.0)];
        let profile = build_profile(&bars, &no_decay(Resolution::BinCount(5))).unwrap();
        // Bins of width 2 from 10 to 20; the first bar covers two of them.
        assert_eq!(profile.bins[0].volume, 50.0);
        assert_eq!(profile.bins[1].volume, 50.0);
        assert_eq!(profile.bins[2].volume, 0.0);
    }

    #[test]
    fn test_point_bar_and_close_policy() {
        let bars = vec![bar(0, 10.0, 20.0, 19.0, 0.0), bar(1, 13.0, 13.0, 13.0, 40.0)];
        let profile = build_profile(&bars, &no_decay(Resolution::BinCount(5))).unwrap();
        assert_eq!(profile.bins[1].volume, 40.0);

        let bars = vec![bar(0, 10.0, 20.0, 19.0, 60.0), bar(1, 11.0, 12.0, 11.5, 0.0)];
        let params = ProfileParams {
            distribution: DistributionPolicy::Close,
            ..no_decay(Resolution::BinCount(5))
        };
        let profile = build_profile(&bars, &params).unwrap();
        assert_eq!(profile.bins[4].volume, 60.0);
    }

    #[test]
    fn test_zero_volume_bars_widen_range_only() {
        let bars = vec![bar(0, 50.0, 60.0, 55.0, 0.0), bar(1, 54.0, 56.0, 55.0, 10.0)];
        let profile = build_profile(&bars, &no_decay(Resolution::BinCount(10))).unwrap();
        assert_eq!(profile.min_low, 50.0);
        assert_eq!(profile.max_high, 60.0);
        assert_eq!(profile.bins[0].volume, 0.0);
        assert!((profile.bins.iter().map(|b| b.volume).sum::<f64>() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_exponential_decay_weights_recent_bars() {
        let bars: Vec<Bar> = (0..3)
            .map(|i| Bar {
                timestamp: start() + Duration::days(10 * i),
                ..bar(0, 100.0, 110.0, 105.0, 100.0)
            })
            .collect();
        let weights = decay_weights(&bars, Decay::Exponential { half_life_days: 10.0 });
        assert!((weights[0] - 0.25).abs() < 1e-12);
        assert!((weights[1] - 0.5).abs() < 1e-12);
        assert!((weights[2] - 1.0).abs() < 1e-12);

        let profile = build_profile(&bars, &ProfileParams::default()).unwrap();
        assert_eq!(profile.total_volume, 300.0);
        assert!((profile.total_weighted_volume - 175.0).abs() < 1e-9);
    }
}
