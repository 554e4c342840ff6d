//! Chart and table rendering.
//!
//! Both artifacts are returned as bytes. Nothing here touches the published
//! directory tree.

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::NaiveDate;
use plotters::coord::Shift;
use plotters::prelude::*;
use plotters::style::register_font;
use tracing::{info, warn};

use crate::config::RenderConfig;
use crate::errors::PipelineError;
use crate::models::{AccumulationSeries, Artifact, Bar, ChipProfile, ChipZones, Language, ZoneType};

pub const CSV_COLUMNS: [&str; 10] = [
    "low",
    "high",
    "volume",
    "weighted_volume",
    "share_pct",
    "percentile_rank",
    "recent_strength",
    "all_strength",
    "avg_strength",
    "zone_type",
];

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const FONT_FAMILY: &str = "sans-serif";

const PERSISTENT_COLOR: RGBColor = RGBColor(0xCC, 0x55, 0x22);
const SHORT_TERM_COLOR: RGBColor = RGBColor(0xFF, 0x8A, 0x33);
const PROFILE_COLOR: RGBColor = RGBColor(0x7A, 0x8C, 0xA8);
const LONG_COLOR: RGBColor = RGBColor(0xD0, 0x20, 0x20);
const SHORT_COLOR: RGBColor = RGBColor(0x20, 0x9A, 0x30);
const VOLUME_COLOR: RGBColor = RGBColor(0x80, 0x80, 0x80);
const OI_COLOR: RGBColor = RGBColor(0x1F, 0x4E, 0xD8);

const LEFT_AXIS: u32 = 70;
const RIGHT_AXIS: u32 = 50;
const BOTTOM_AXIS: u32 = 36;

/// Everything the renderer needs for one symbol.
pub struct RenderInput<'a> {
    pub symbol: &'a str,
    pub bars: &'a [Bar],
    pub profile: &'a ChipProfile,
    pub zones: &'a ChipZones,
    pub accumulation: &'a AccumulationSeries,
}

pub fn render_artifact(
    input: &RenderInput<'_>,
    config: &RenderConfig,
    run_date: NaiveDate,
) -> Result<Artifact, PipelineError> {
    check_input(input)?;
    let csv = render_csv(input.profile, input.zones, config.precision)?;
    let png = render_png(input, config)?;

    Ok(Artifact {
        symbol: input.symbol.to_string(),
        run_date,
        png,
        csv,
    })
}

fn check_input(input: &RenderInput<'_>) -> Result<(), PipelineError> {
    if input.profile.is_empty() {
        return Err(PipelineError::Render(format!("{}: empty profile", input.symbol)));
    }
    if input.zones.strengths.len() != input.profile.len() {
        return Err(PipelineError::Render(format!(
            "{}: {} zone rows for {} bins",
            input.symbol,
            input.zones.strengths.len(),
            input.profile.len()
        )));
    }
    if input.bars.is_empty() {
        return Err(PipelineError::Render(format!("{}: no bars to draw", input.symbol)));
    }
    Ok(())
}

/// Formatted values of bin `index`, in [`CSV_COLUMNS`] order.
pub fn bin_row(profile: &ChipProfile, zones: &ChipZones, index: usize, precision: usize) -> Vec<String> {
    let bin = &profile.bins[index];
    let total: f64 = profile.bins.iter().map(|b| b.volume).sum();
    let share = if total > 0.0 { bin.volume / total * 100.0 } else { 0.0 };
    let at_or_below = profile.bins.iter().filter(|b| b.volume <= bin.volume).count();
    let rank = at_or_below as f64 / profile.len() as f64 * 100.0;

    let mut row = vec![
        fixed(bin.low, precision),
        fixed(bin.high, precision),
        fixed(bin.volume, precision),
        fixed(bin.weighted_volume, precision),
        fixed(share, 2),
        fixed(rank, 2),
    ];
    match zones.strengths.get(index) {
        Some(s) => row.extend([
            fixed(s.recent_strength, 3),
            fixed(s.all_strength, 3),
            fixed(s.avg_strength, 3),
            s.zone_type.as_str().to_string(),
        ]),
        None => row.extend([
            fixed(0.0, 3),
            fixed(0.0, 3),
            fixed(0.0, 3),
            ZoneType::None.as_str().to_string(),
        ]),
    }
    row
}

fn fixed(value: f64, precision: usize) -> String {
    // Avoid "-0.00" for values that round to zero.
    let text = format!("{:.*}", precision, value);
    if text.starts_with('-') && text[1..].chars().all(|c| c == '0' || c == '.') {
        text[1..].to_string()
    } else {
        text
    }
}

/// One row per bin, ascending by `low`, UTF-8 with BOM.
pub fn render_csv(profile: &ChipProfile, zones: &ChipZones, precision: usize) -> Result<Vec<u8>, PipelineError> {
    let mut order: Vec<usize> = (0..profile.len()).collect();
    order.sort_by(|&a, &b| profile.bins[a].low.total_cmp(&profile.bins[b].low));

    let mut writer = csv::Writer::from_writer(UTF8_BOM.to_vec());
    writer.write_record(CSV_COLUMNS)?;
    for index in order {
        writer.write_record(bin_row(profile, zones, index, precision))?;
    }
    writer
        .into_inner()
        .map_err(|e| PipelineError::Render(format!("csv: {}", e)))
}

static CHART_FONT: OnceLock<Option<PathBuf>> = OnceLock::new();

/// Register the first usable font from `candidates` once per process.
/// Returns whether chart text can be drawn.
pub fn chart_font(candidates: &[PathBuf]) -> bool {
    CHART_FONT.get_or_init(|| load_font(candidates)).is_some()
}

fn load_font(candidates: &[PathBuf]) -> Option<PathBuf> {
    for path in candidates {
        let Ok(bytes) = std::fs::read(path) else {
            continue;
        };
        // Registered fonts live for the rest of the process.
        let bytes: &'static [u8] = Box::leak(bytes.into_boxed_slice());
        if register_font(FONT_FAMILY, FontStyle::Normal, bytes).is_ok() {
            info!("🔤 Chart font: {}", path.display());
            return Some(path.clone());
        }
        warn!("Skipping unreadable font {}", path.display());
    }
    warn!("⚠️ No chart font found among {} candidate(s); charts will have no text", candidates.len());
    None
}

struct ChartLabels {
    language: Language,
    title: String,
    price: &'static str,
    strength: &'static str,
    long: &'static str,
    short: &'static str,
    profile: &'static str,
    volume: &'static str,
    open_interest: &'static str,
}

impl ChartLabels {
    fn new(symbol: &str, language: Language) -> Self {
        match language {
            Language::Zh => Self {
                language,
                title: format!("{} 吸筹强度与筹码区分布", symbol),
                price: "价格",
                strength: "强度",
                long: "多头吸筹强度(右)",
                short: "空头吸筹强度(右)",
                profile: "筹码分布",
                volume: "成交量",
                open_interest: "持仓量",
            },
            Language::En => Self {
                language,
                title: format!("{} accumulation strength and chip zones", symbol),
                price: "Price",
                strength: "strength",
                long: "Long accumulation (right)",
                short: "Short accumulation (right)",
                profile: "Volume profile",
                volume: "Volume",
                open_interest: "Open interest",
            },
        }
    }
}

fn zone_color(zone: ZoneType) -> RGBColor {
    match zone {
        ZoneType::Persistent => PERSISTENT_COLOR,
        ZoneType::ShortTerm => SHORT_TERM_COLOR,
        ZoneType::None => PROFILE_COLOR,
    }
}

pub fn render_png(input: &RenderInput<'_>, config: &RenderConfig) -> Result<Vec<u8>, PipelineError> {
    let with_text = chart_font(&config.font_candidates);

    // The bitmap encoder only writes to paths, so draw into a private scratch dir.
    let scratch = tempfile::Builder::new()
        .prefix("chipzones-render")
        .tempdir()
        .map_err(|e| PipelineError::Render(format!("scratch dir: {}", e)))?;
    let path = scratch.path().join("chart.png");

    draw_to(&path, input, config, with_text).map_err(|e| PipelineError::Render(e.to_string()))?;

    std::fs::read(&path).map_err(|e| PipelineError::Render(format!("read back chart: {}", e)))
}

fn draw_to(path: &Path, input: &RenderInput<'_>, config: &RenderConfig, with_text: bool) -> Result<(), Box<dyn Error>> {
    let root = BitMapBackend::new(path, (config.width, config.height)).into_drawing_area();
    root.fill(&WHITE)?;

    let labels = ChartLabels::new(input.symbol, config.language);
    let (upper, lower) = root.split_vertically(config.height * 2 / 3);
    let split_x = config.width * 4 / 5;
    let (price_area, profile_area) = upper.split_horizontally(split_x);
    let (volume_area, _) = lower.split_horizontally(split_x);

    draw_price_panel(&price_area, input, &labels, with_text)?;
    draw_profile_panel(&profile_area, input, &labels, with_text)?;
    draw_volume_panel(&volume_area, input, &labels, with_text)?;

    root.present()?;
    Ok(())
}

fn price_bounds(profile: &ChipProfile) -> (f64, f64) {
    let top = profile.edges().last().copied().unwrap_or(profile.max_high);
    let pad = (top - profile.min_low) * 0.02;
    (profile.min_low - pad, top + pad)
}

fn time_label(bars: &[Bar], x: f64) -> String {
    if x < 0.0 {
        return String::new();
    }
    bars.get(x as usize)
        .map(|b| b.timestamp.format("%m-%d %H:%M").to_string())
        .unwrap_or_default()
}

fn draw_price_panel(
    area: &DrawingArea<BitMapBackend<'_>, Shift>,
    input: &RenderInput<'_>,
    labels: &ChartLabels,
    with_text: bool,
) -> Result<(), Box<dyn Error>> {
    let n = input.bars.len().max(1) as f64;
    let (y_lo, y_hi) = price_bounds(input.profile);

    let mut builder = ChartBuilder::on(area);
    builder.margin(10u32);
    if with_text {
        builder
            .caption(&labels.title, (FONT_FAMILY, 22))
            .x_label_area_size(BOTTOM_AXIS)
            .y_label_area_size(LEFT_AXIS)
            .right_y_label_area_size(RIGHT_AXIS);
    }
    let mut chart = builder
        .build_cartesian_2d(0f64..n, y_lo..y_hi)?
        .set_secondary_coord(0f64..n, 0f64..1f64);

    let zone_bins = || {
        input
            .profile
            .bins
            .iter()
            .zip(&input.zones.strengths)
            .filter(|(_, s)| s.zone_type.is_zone())
    };

    chart.draw_series(zone_bins().map(|(bin, s)| {
        Rectangle::new(
            [(0.0, bin.low), (n, bin.high)],
            zone_color(s.zone_type).mix(0.25).filled(),
        )
    }))?;

    if with_text {
        let x_label = |x: &f64| time_label(input.bars, *x);
        chart
            .configure_mesh()
            .disable_x_mesh()
            .x_labels(8)
            .x_label_formatter(&x_label)
            .y_desc(labels.price)
            .draw()?;
        chart.configure_secondary_axes().y_desc(labels.strength).draw()?;
    }

    chart
        .draw_series(LineSeries::new(
            input.bars.iter().enumerate().map(|(i, b)| (i as f64 + 0.5, b.close)),
            BLACK.stroke_width(2),
        ))?
        .label(labels.price)
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &BLACK));

    let acc = input.accumulation;
    chart
        .draw_secondary_series(LineSeries::new(
            acc.long_strength.iter().enumerate().map(|(i, &v)| (i as f64 + 0.5, v)),
            &LONG_COLOR,
        ))?
        .label(labels.long)
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &LONG_COLOR));
    chart
        .draw_secondary_series(LineSeries::new(
            acc.short_strength.iter().enumerate().map(|(i, &v)| (i as f64 + 0.5, v)),
            &SHORT_COLOR,
        ))?
        .label(labels.short)
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &SHORT_COLOR));

    if with_text {
        chart.draw_series(zone_bins().map(|(bin, s)| {
            let color = match s.zone_type {
                ZoneType::Persistent => RGBColor(0xC2, 0x4E, 0x1A),
                _ => RGBColor(0xB3, 0x5A, 0x00),
            };
            Text::new(
                format!(
                    "{:.0}-{:.0} {} {}: {:.2}",
                    bin.low,
                    bin.high,
                    s.zone_type.label(labels.language),
                    labels.strength,
                    s.avg_strength
                ),
                (0.5, bin.high),
                (FONT_FAMILY, 13).into_font().color(&color),
            )
        }))?;

        chart
            .configure_series_labels()
            .position(SeriesLabelPosition::UpperLeft)
            .background_style(&WHITE.mix(0.8))
            .border_style(&BLACK)
            .label_font((FONT_FAMILY, 14))
            .draw()?;
    }
    Ok(())
}

fn draw_profile_panel(
    area: &DrawingArea<BitMapBackend<'_>, Shift>,
    input: &RenderInput<'_>,
    labels: &ChartLabels,
    with_text: bool,
) -> Result<(), Box<dyn Error>> {
    let (y_lo, y_hi) = price_bounds(input.profile);
    let max_volume = input.profile.max_volume().max(1.0) * 1.05;

    let mut builder = ChartBuilder::on(area);
    builder.margin(10u32);
    if with_text {
        // Same caption height and bottom axis as the price panel so the price scales line up.
        builder
            .caption(labels.profile, (FONT_FAMILY, 22))
            .x_label_area_size(BOTTOM_AXIS);
    }
    let mut chart = builder.build_cartesian_2d(0f64..max_volume, y_lo..y_hi)?;

    if with_text {
        chart
            .configure_mesh()
            .disable_mesh()
            .x_labels(3)
            .x_label_formatter(&|v: &f64| compact(*v))
            .draw()?;
    }

    chart.draw_series(
        input
            .profile
            .bins
            .iter()
            .zip(&input.zones.strengths)
            .filter(|(bin, _)| bin.volume > 0.0)
            .map(|(bin, s)| {
                Rectangle::new(
                    [(0.0, bin.low), (bin.volume, bin.high)],
                    zone_color(s.zone_type).mix(0.8).filled(),
                )
            }),
    )?;
    Ok(())
}

fn draw_volume_panel(
    area: &DrawingArea<BitMapBackend<'_>, Shift>,
    input: &RenderInput<'_>,
    labels: &ChartLabels,
    with_text: bool,
) -> Result<(), Box<dyn Error>> {
    let bars = input.bars;
    let n = bars.len().max(1) as f64;
    let max_volume = bars.iter().map(|b| b.volume).fold(0.0, f64::max).max(1.0) * 1.1;

    let oi: Vec<(f64, f64)> = bars
        .iter()
        .enumerate()
        .filter_map(|(i, b)| b.open_interest.map(|v| (i as f64 + 0.5, v)))
        .collect();
    let (oi_lo, oi_hi) = oi
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &(_, v)| (lo.min(v), hi.max(v)));
    let (oi_lo, oi_hi) = if oi.is_empty() {
        (0.0, 1.0)
    } else if oi_hi > oi_lo {
        let pad = (oi_hi - oi_lo) * 0.05;
        (oi_lo - pad, oi_hi + pad)
    } else {
        (oi_lo - 1.0, oi_hi + 1.0)
    };

    let mut builder = ChartBuilder::on(area);
    builder.margin(10u32);
    if with_text {
        builder
            .x_label_area_size(BOTTOM_AXIS)
            .y_label_area_size(LEFT_AXIS)
            .right_y_label_area_size(RIGHT_AXIS);
    }
    let mut chart = builder
        .build_cartesian_2d(0f64..n, 0f64..max_volume)?
        .set_secondary_coord(0f64..n, oi_lo..oi_hi);

    if with_text {
        let x_label = |x: &f64| time_label(bars, *x);
        chart
            .configure_mesh()
            .disable_x_mesh()
            .x_labels(8)
            .x_label_formatter(&x_label)
            .y_label_formatter(&|v: &f64| compact(*v))
            .y_desc(labels.volume)
            .draw()?;
        chart
            .configure_secondary_axes()
            .y_label_formatter(&|v: &f64| compact(*v))
            .y_desc(labels.open_interest)
            .draw()?;
    }

    chart
        .draw_series(bars.iter().enumerate().map(|(i, b)| {
            let x = i as f64;
            Rectangle::new([(x + 0.1, 0.0), (x + 0.9, b.volume)], VOLUME_COLOR.mix(0.35).filled())
        }))?
        .label(labels.volume)
        .legend(|(x, y)| Rectangle::new([(x, y - 4), (x + 20, y + 4)], VOLUME_COLOR.mix(0.35).filled()));

    if !oi.is_empty() {
        chart
            .draw_secondary_series(LineSeries::new(oi, &OI_COLOR))?
            .label(labels.open_interest)
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &OI_COLOR));
    }

    if with_text {
        chart
            .configure_series_labels()
            .position(SeriesLabelPosition::UpperRight)
            .background_style(&WHITE.mix(0.8))
            .border_style(&BLACK)
            .label_font((FONT_FAMILY, 14))
            .draw()?;
    }
    Ok(())
}

/// Short axis labels for large volumes: 12500 -> "12.5k".
fn compact(value: f64) -> String {
    let abs = value.abs();
    if abs >= 1e6 {
        format!("{:.1}M", value / 1e6)
    } else if abs >= 1e3 {
        format!("{:.1}k", value / 1e3)
    } else {
        format!("{:.0}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BinStrength, PriceBin};
    use chrono::Duration;

    fn fixture() -> (Vec<Bar>, ChipProfile, ChipZones, AccumulationSeries) {
        let t0 = NaiveDate::from_ymd_opt(2025, 9, 3).unwrap().and_hms_opt(9, 0, 0).unwrap();
        let bars: Vec<Bar> = (0..6)
            .map(|i| Bar {
                timestamp: t0 + Duration::hours(i),
                open: 100.0 + i as f64,
                high: 102.0 + i as f64,
                low: 99.0 + i as f64,
                close: 101.0 + i as f64,
                volume: 100.0 * (i + 1) as f64,
                open_interest: Some(5000.0 + 10.0 * i as f64),
            })
            .collect();

        let volumes = [300.0, 0.0, 1200.0, 600.0];
        let profile = ChipProfile {
            bins: volumes
                .iter()
                .enumerate()
                .map(|(i, &v)| PriceBin {
                    low: 99.0 + 2.0 * i as f64,
                    high: 101.0 + 2.0 * i as f64,
                    volume: v,
                    weighted_volume: v * 0.5,
                })
                .collect(),
            bar_count: 6,
            total_volume: 2100.0,
            total_weighted_volume: 1050.0,
            min_low: 99.0,
            max_high: 107.0,
        };
        let zones = ChipZones {
            strengths: volumes
                .iter()
                .map(|&v| BinStrength {
                    recent_strength: v / 1200.0,
                    all_strength: v / 1200.0,
                    avg_strength: v / 1200.0,
                    zone_type: if v >= 1200.0 {
                        ZoneType::Persistent
                    } else if v >= 600.0 {
                        ZoneType::ShortTerm
                    } else {
                        ZoneType::None
                    },
                })
                .collect(),
            recent_threshold: 0.5,
            all_threshold: 0.5,
        };
        let accumulation = AccumulationSeries {
            long_strength: vec![0.0, 0.1, 0.4, 0.8, 1.0, 0.9],
            short_strength: vec![0.0, 0.3, 0.2, 0.1, 0.0, 0.05],
        };
        (bars, profile, zones, accumulation)
    }

    fn small_config() -> RenderConfig {
        RenderConfig {
            width: 480,
            height: 320,
            ..RenderConfig::default()
        }
    }

    #[test]
    fn test_csv_rows_match_bins() {
        let (_, profile, zones, _) = fixture();
        let csv = render_csv(&profile, &zones, 2).unwrap();
        assert!(csv.starts_with(UTF8_BOM));

        let text = String::from_utf8(csv[UTF8_BOM.len()..].to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], CSV_COLUMNS.join(","));
        assert_eq!(lines.len(), profile.len() + 1);
        assert_eq!(lines[1], "99.00,101.00,300.00,150.00,14.29,50.00,0.250,0.250,0.250,none");
        assert_eq!(lines[3], "103.00,105.00,1200.00,600.00,57.14,100.00,1.000,1.000,1.000,persistent");

        let lows: Vec<f64> = lines[1..]
            .iter()
            .map(|l| l.split(',').next().unwrap().parse().unwrap())
            .collect();
        assert!(lows.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_csv_is_byte_stable() {
        let (_, profile, zones, _) = fixture();
        assert_eq!(
            render_csv(&profile, &zones, 2).unwrap(),
            render_csv(&profile, &zones, 2).unwrap()
        );
    }

    #[test]
    fn test_csv_sorts_unordered_bins() {
        let (_, mut profile, mut zones, _) = fixture();
        profile.bins.reverse();
        zones.strengths.reverse();
        let csv = render_csv(&profile, &zones, 0).unwrap();
        let text = String::from_utf8(csv[UTF8_BOM.len()..].to_vec()).unwrap();
        assert!(text.lines().nth(1).unwrap().starts_with("99,101,300,"));
    }

    #[test]
    fn test_fixed_never_prints_negative_zero() {
        assert_eq!(fixed(-0.0001, 2), "0.00");
        assert_eq!(fixed(-1.5, 1), "-1.5");
        assert_eq!(fixed(2.0, 0), "2");
    }

    #[test]
    fn test_render_artifact_produces_png_and_csv() {
        let (bars, profile, zones, accumulation) = fixture();
        let input = RenderInput {
            symbol: "JM2601",
            bars: &bars,
            profile: &profile,
            zones: &zones,
            accumulation: &accumulation,
        };
        let day = NaiveDate::from_ymd_opt(2025, 10, 18).unwrap();
        let artifact = render_artifact(&input, &small_config(), day).unwrap();

        assert_eq!(&artifact.png[..4], b"\x89PNG");
        assert!(!artifact.csv.is_empty());
        assert_eq!(artifact.symbol, "JM2601");
        assert_eq!(artifact.run_date, day);
    }

    #[test]
    fn test_empty_profile_is_render_error() {
        let (bars, mut profile, mut zones, accumulation) = fixture();
        profile.bins.clear();
        zones.strengths.clear();
        let input = RenderInput {
            symbol: "JM2601",
            bars: &bars,
            profile: &profile,
            zones: &zones,
            accumulation: &accumulation,
        };
        let err = render_artifact(&input, &small_config(), NaiveDate::from_ymd_opt(2025, 10, 18).unwrap())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Render(_)));
    }

    #[test]
    fn test_compact_labels() {
        assert_eq!(compact(950.0), "950");
        assert_eq!(compact(12_500.0), "12.5k");
        assert_eq!(compact(3_200_000.0), "3.2M");
    }
}
