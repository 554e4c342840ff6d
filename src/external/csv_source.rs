use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};

use crate::external::market_data::{clip_to_range, normalize_bars, MarketDataError, MarketDataSource};
use crate::models::{Bar, BarInterval};

/// Row layout of the raw bar archive written under `data_dir`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CsvBarRow {
    pub datetime: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub open_interest: Option<f64>,
}

impl From<&Bar> for CsvBarRow {
    fn from(bar: &Bar) -> Self {
        Self {
            datetime: bar.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
            open_interest: bar.open_interest,
        }
    }
}

impl CsvBarRow {
    fn into_bar(self) -> Result<Bar, MarketDataError> {
        let raw = self.datetime.trim();
        let timestamp = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
            .or_else(|_| {
                NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default())
            })
            .map_err(|e| MarketDataError::Parse(format!("{}: {}", raw, e)))?;

        Ok(Bar {
            timestamp,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            open_interest: self.open_interest,
        })
    }
}

/// `JM2601_2025-09-03_2025-10-18_60m.csv`
pub fn archive_file_name(code: &str, start: NaiveDate, end: NaiveDate, interval: BarInterval) -> String {
    format!("{}_{}_{}_{}.csv", code, start, end, interval)
}

/// Serialize bars in the archive layout.
pub fn bars_to_csv(bars: &[Bar]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for bar in bars {
        writer.serialize(CsvBarRow::from(bar))?;
    }
    writer
        .into_inner()
        .map_err(|e| csv::Error::from(std::io::Error::other(e.to_string())))
}

/// Replays archived bar files instead of calling a remote feed.
///
/// For each symbol it picks the most recently modified `{CODE}_*_{interval}.csv`
/// in the directory.
pub struct CsvDirectorySource {
    dir: PathBuf,
}

impl CsvDirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn latest_file(&self, code: &str, interval: BarInterval) -> Result<Option<PathBuf>, MarketDataError> {
        let prefix = format!("{}_", code);
        let suffix = format!("_{}.csv", interval);

        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(MarketDataError::Network(format!("{}: {}", self.dir.display(), e))),
        };

        let mut best: Option<(std::time::SystemTime, PathBuf)> = None;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !(name.starts_with(&prefix) && name.ends_with(&suffix)) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH);
            if best.as_ref().map_or(true, |(t, _)| modified > *t) {
                best = Some((modified, entry.path()));
            }
        }
        Ok(best.map(|(_, p)| p))
    }
}

pub fn read_bars(path: &Path) -> Result<Vec<Bar>, MarketDataError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| MarketDataError::BadResponse(format!("{}: {}", path.display(), e)))?;
    // Archives written by spreadsheet tools may carry a BOM.
    let content = content.trim_start_matches('\u{feff}');

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let mut bars = Vec::new();
    for (line, row) in reader.deserialize::<CsvBarRow>().enumerate() {
        let row = row.map_err(|e| MarketDataError::Parse(format!("line {}: {}", line + 2, e)))?;
        bars.push(row.into_bar()?);
    }
    Ok(normalize_bars(bars))
}

#[async_trait]
impl MarketDataSource for CsvDirectorySource {
    async fn fetch_bars(
        &self,
        code: &str,
        start: NaiveDate,
        end: NaiveDate,
        interval: BarInterval,
    ) -> Result<Vec<Bar>, MarketDataError> {
        let path = self
            .latest_file(code, interval)?
            .ok_or_else(|| MarketDataError::NotFound(code.to_string()))?;

        let bars = clip_to_range(read_bars(&path)?, start, end);
        if bars.is_empty() {
            return Err(MarketDataError::Empty(code.to_string()));
        }
        Ok(bars)
    }

    fn name(&self) -> &'static str {
        "csv_dir"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bars() -> Vec<Bar> {
        (0..3)
            .map(|i| Bar {
                timestamp: NaiveDate::from_ymd_opt(2025, 9, 3)
                    .unwrap()
                    .and_hms_opt(9 + i, 0, 0)
                    .unwrap(),
                open: 100.0 + i as f64,
                high: 101.0 + i as f64,
                low: 99.0 + i as f64,
                close: 100.5 + i as f64,
                volume: 10.0,
                open_interest: if i == 1 { None } else { Some(500.0) },
            })
            .collect()
    }

    #[tokio::test]
    async fn test_archive_then_replay() {
        let dir = tempfile::tempdir().unwrap();
        let start = NaiveDate::from_ymd_opt(2025, 9, 3).unwrap();
        let name = archive_file_name("JM2601", start, start, BarInterval::SixtyMinutes);
        assert_eq!(name, "JM2601_2025-09-03_2025-09-03_60m.csv");

        std::fs::write(dir.path().join(&name), bars_to_csv(&sample_bars()).unwrap()).unwrap();

        let source = CsvDirectorySource::new(dir.path());
        let bars = source
            .fetch_bars("JM2601", start, start, BarInterval::SixtyMinutes)
            .await
            .unwrap();
        assert_eq!(bars, sample_bars());
    }

    #[tokio::test]
    async fn test_missing_symbol_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let source = CsvDirectorySource::new(dir.path());
        let day = NaiveDate::from_ymd_opt(2025, 9, 3).unwrap();
        let err = source
            .fetch_bars("RB2601", day, day, BarInterval::SixtyMinutes)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketDataError::NotFound(_)));
    }

    #[test]
    fn test_reads_date_only_rows_with_bom() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("JM2601_x_daily.csv");
        std::fs::write(
            &path,
            "\u{feff}datetime,open,high,low,close,volume,open_interest\n2025-09-03,1,2,0.5,1.5,100,\n",
        )
        .unwrap();
        let bars = read_bars(&path).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].open_interest, None);
    }
}
