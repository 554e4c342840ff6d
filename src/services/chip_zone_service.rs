use crate::config::AnalysisConfig;
use crate::models::{Bar, BinStrength, ChipProfile, ChipZones, Decay, DistributionPolicy, ZoneType};
use crate::services::indicators::quantile;
use crate::services::volume_profile_service::{decay_weights, distribute};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoneParams {
    pub window_zone: usize,
    pub beta: f64,
    pub quantile: f64,
    pub decay: Decay,
    pub distribution: DistributionPolicy,
}

impl From<&AnalysisConfig> for ZoneParams {
    fn from(config: &AnalysisConfig) -> Self {
        Self {
            window_zone: config.window_zone,
            beta: config.beta,
            quantile: config.quantile,
            decay: config.decay,
            distribution: config.distribution,
        }
    }
}

/// Per-bar zone weight: volume, boosted by open-interest build-up, decayed by age.
///
/// `volume * (1 + max(ΔOI, 0))^beta * decay(age)`. Bars without open interest
/// (or following one without it) get no boost.
pub fn zone_weights(bars: &[Bar], beta: f64, decay: Decay) -> Vec<f64> {
    let decay = decay_weights(bars, decay);

    bars.iter()
        .enumerate()
        .map(|(i, bar)| {
            let delta_oi = match (i.checked_sub(1).and_then(|p| bars[p].open_interest), bar.open_interest) {
                (Some(prev), Some(curr)) => (curr - prev).max(0.0),
                _ => 0.0,
            };
            bar.volume * (1.0 + delta_oi).powf(beta) * decay[i]
        })
        .collect()
}

/// Classify every profile bin by how concentrated the weighted volume is,
/// both over the latest `window_zone` bars and over the whole series.
///
/// Each histogram is scaled so its largest bin is 1. A bin passes a window
/// when it reaches that window's `quantile` of non-empty bins.
pub fn estimate_zones(bars: &[Bar], profile: &ChipProfile, params: &ZoneParams) -> ChipZones {
    let edges = profile.edges();
    let weights = zone_weights(bars, params.beta, params.decay);

    let all = normalized(distribute(bars, &edges, params.distribution, &weights));

    let recent_from = bars.len().saturating_sub(params.window_zone);
    let recent = normalized(distribute(
        &bars[recent_from..],
        &edges,
        params.distribution,
        &weights[recent_from..],
    ));

    let recent_threshold = positive_quantile(&recent, params.quantile);
    let all_threshold = positive_quantile(&all, params.quantile);

    let strengths = recent
        .iter()
        .zip(&all)
        .map(|(&r, &a)| {
            let in_recent = recent_threshold.is_some_and(|t| r > 0.0 && r >= t);
            let in_all = all_threshold.is_some_and(|t| a > 0.0 && a >= t);
            let zone_type = match (in_recent, in_all) {
                (true, true) => ZoneType::Persistent,
                (true, false) | (false, true) => ZoneType::ShortTerm,
                (false, false) => ZoneType::None,
            };
            BinStrength {
                recent_strength: r,
                all_strength: a,
                avg_strength: (r + a) / 2.0,
                zone_type,
            }
        })
        .collect();

    ChipZones {
        strengths,
        recent_threshold: recent_threshold.unwrap_or(1.0),
        all_threshold: all_threshold.unwrap_or(1.0),
    }
}

fn normalized(mut hist: Vec<f64>) -> Vec<f64> {
    let max = hist.iter().copied().fold(0.0, f64::max);
    if max > 0.0 {
        hist.iter_mut().for_each(|v| *v /= max);
    }
    hist
}

fn positive_quantile(hist: &[f64], q: f64) -> Option<f64> {
    let positive: Vec<f64> = hist.iter().copied().filter(|&v| v > 0.0).collect();
    quantile(&positive, q)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::volume_profile_service::{build_profile, ProfileParams};
    use crate::models::Resolution;
    use chrono::{Duration, NaiveDate};

    fn bars(spec: &[(f64, f64, Option<f64>)]) -> Vec<Bar> {
        let t0 = NaiveDate::from_ymd_opt(2025, 9, 3).unwrap().and_hms_opt(9, 0, 0).unwrap();
        spec.iter()
            .enumerate()
            .map(|(i, &(close, volume, oi))| Bar {
                timestamp: t0 + Duration::hours(i as i64),
                open: close,
                high: close,
                low: close,
                close,
                volume,
                open_interest: oi,
            })
            .collect()
    }

    fn params(window_zone: usize) -> ZoneParams {
        ZoneParams {
            window_zone,
            beta: 0.7,
            quantile: 0.8,
            decay: Decay::None,
            distribution: DistributionPolicy::Close,
        }
    }

    fn profile(bars: &[Bar]) -> ChipProfile {
        build_profile(
            bars,
            &ProfileParams {
                resolution: Resolution::BinCount(5),
                decay: Decay::None,
                ..ProfileParams::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_oi_increase_boosts_weight() {
        let series = bars(&[(100.0, 10.0, Some(1000.0)), (101.0, 10.0, Some(1003.0)), (102.0, 10.0, Some(990.0))]);
        let w = zone_weights(&series, 0.5, Decay::None);
        assert_eq!(w[0], 10.0);
        assert!((w[1] - 20.0).abs() < 1e-9); // 10 * sqrt(4)
        assert_eq!(w[2], 10.0);

        let no_oi = bars(&[(100.0, 10.0, None), (101.0, 10.0, Some(2000.0))]);
        assert_eq!(zone_weights(&no_oi, 0.7, Decay::None), vec![10.0, 10.0]);
    }

    #[test]
    fn test_persistent_and_short_term_zones() {
        // Old heavy trading near 10, heavier recent trading near 20.
        let series = bars(&[
            (10.0, 500.0, None),
            (10.5, 400.0, None),
            (14.0, 10.0, None),
            (16.0, 10.0, None),
            (20.0, 600.0, None),
            (19.8, 400.0, None),
        ]);
        let profile = profile(&series);
        let zones = estimate_zones(&series, &profile, &ZoneParams { quantile: 0.5, ..params(2) });

        assert_eq!(zones.strengths.len(), profile.len());
        // Bin 0 [10,12) is strong over the whole series but absent recently.
        assert_eq!(zones.strengths[0].zone_type, ZoneType::ShortTerm);
        assert!((zones.strengths[0].all_strength - 0.9).abs() < 1e-12);
        assert_eq!(zones.strengths[0].recent_strength, 0.0);
        // Bin 4 [18,20] is the maximum of both windows.
        assert_eq!(zones.strengths[4].zone_type, ZoneType::Persistent);
        assert_eq!(zones.strengths[4].recent_strength, 1.0);
        assert_eq!(zones.strengths[4].all_strength, 1.0);
        // Thin middle bins are not zones.
        assert_eq!(zones.strengths[1].zone_type, ZoneType::None);
        assert_eq!(zones.strengths[2].zone_type, ZoneType::None);
        assert_eq!(zones.zone_count(), 2);
    }

    #[test]
    fn test_strengths_are_normalized() {
        let series = bars(&[(10.0, 3.0, None), (15.0, 9.0, None), (20.0, 6.0, None)]);
        let profile = profile(&series);
        let zones = estimate_zones(&series, &profile, &params(60));
        for s in &zones.strengths {
            assert!((0.0..=1.0).contains(&s.recent_strength));
            assert!((0.0..=1.0).contains(&s.all_strength));
            assert!((s.avg_strength - (s.recent_strength + s.all_strength) / 2.0).abs() < 1e-12);
        }
        // Window longer than the series: both histograms are identical.
        assert!(zones
            .strengths
            .iter()
            .all(|s| s.recent_strength == s.all_strength));
    }

    #[test]
    fn test_all_zero_volume_has_no_zones() {
        let series = bars(&[(10.0, 0.0, None), (20.0, 0.0, None)]);
        let profile = profile(&series);
        let zones = estimate_zones(&series, &profile, &params(60));
        assert_eq!(zones.zone_count(), 0);
        assert_eq!(zones.recent_threshold, 1.0);
    }
}
