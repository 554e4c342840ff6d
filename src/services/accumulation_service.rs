use crate::models::{AccumulationSeries, Bar};
use crate::services::indicators::{ewm, pct_change, quantile, rolling, sma};

/// Long/short accumulation strength, one value per bar, scaled to [0, 1].
///
/// Over a trailing `window` the share of positive returns (long) or negative
/// returns (short) in total absolute return is multiplied by relative volume
/// (volume over its rolling mean), smoothed with an EWM of span `smooth`, and
/// finally min-max scaled between the 2nd and 98th percentiles.
pub fn accumulation_strength(bars: &[Bar], window: usize, smooth: usize) -> AccumulationSeries {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

    let returns = pct_change(&closes);
    let relative_volume: Vec<f64> = sma(&volumes, window)
        .into_iter()
        .zip(&volumes)
        .map(|(mean, &v)| match mean {
            Some(m) if m != 0.0 => v / m,
            _ => 0.0,
        })
        .collect();

    let long_share = rolling(&returns, window, |w| directional_share(w, 1.0));
    let short_share = rolling(&returns, window, |w| directional_share(w, -1.0));

    AccumulationSeries {
        long_strength: finish(&long_share, &relative_volume, smooth),
        short_strength: finish(&short_share, &relative_volume, smooth),
    }
}

fn directional_share(window: &[f64], sign: f64) -> f64 {
    let directional: f64 = window.iter().map(|r| (r * sign).max(0.0)).sum();
    let total: f64 = window.iter().map(|r| r.abs()).sum();
    directional / (total + 1e-9)
}

fn finish(share: &[Option<f64>], relative_volume: &[f64], smooth: usize) -> Vec<f64> {
    let raw: Vec<Option<f64>> = share
        .iter()
        .zip(relative_volume)
        .map(|(s, &rv)| s.map(|s| s * rv))
        .collect();

    let smoothed: Vec<f64> = ewm(&raw, smooth)
        .into_iter()
        .map(|v| v.filter(|x| x.is_finite()).unwrap_or(0.0))
        .collect();

    let lo = quantile(&smoothed, 0.02).unwrap_or(0.0);
    let hi = quantile(&smoothed, 0.98).unwrap_or(0.0);
    let range = if hi > lo { hi - lo } else { 1.0 };

    smoothed
        .into_iter()
        .map(|v| ((v - lo) / range).clamp(0.0, 1.0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn series(closes: &[f64], volume: f64) -> Vec<Bar> {
        let t0 = NaiveDate::from_ymd_opt(2025, 9, 3).unwrap().and_hms_opt(9, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                timestamp: t0 + Duration::hours(i as i64),
                open: c,
                high: c + 1.0,
                low: c - 1.0,
                close: c,
                volume,
                open_interest: None,
            })
            .collect()
    }

    #[test]
    fn test_lengths_and_bounds() {
        let closes: Vec<f64> = (0..50).map(|i| 100.0 + ((i as f64) * 0.7).sin() * 5.0).collect();
        let out = accumulation_strength(&series(&closes, 1000.0), 20, 7);
        assert_eq!(out.long_strength.len(), 50);
        assert_eq!(out.short_strength.len(), 50);
        for v in out.long_strength.iter().chain(&out.short_strength) {
            assert!((0.0..=1.0).contains(v), "{} out of range", v);
        }
    }

    #[test]
    fn test_rising_market_is_long() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let out = accumulation_strength(&series(&closes, 500.0), 5, 3);
        // Before the first full window nothing is known.
        assert_eq!(out.long_strength[0], 0.0);
        assert!((out.long_strength.last().unwrap() - 1.0).abs() < 1e-6);
        assert_eq!(*out.short_strength.last().unwrap(), 0.0);
    }

    #[test]
    fn test_short_series_is_all_zero() {
        let out = accumulation_strength(&series(&[100.0, 101.0, 102.0], 10.0), 20, 7);
        assert_eq!(out.long_strength, vec![0.0; 3]);
        assert_eq!(out.short_strength, vec![0.0; 3]);
    }

    #[test]
    fn test_directional_share() {
        let share = directional_share(&[0.02, -0.01, 0.01], 1.0);
        assert!((share - 0.75).abs() < 1e-6);
        assert_eq!(directional_share(&[0.0, 0.0], -1.0), 0.0);
    }
}
