use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// One OHLCV sample for a single interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub open_interest: Option<f64>,
}

impl Bar {
    /// High and low can arrive swapped from some feeds; this always returns (low, high).
    pub fn range(&self) -> (f64, f64) {
        if self.low <= self.high {
            (self.low, self.high)
        } else {
            (self.high, self.low)
        }
    }

    pub fn is_finite(&self) -> bool {
        [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .all(|v| v.is_finite())
    }
}

/// Bar sampling interval accepted by the data sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarInterval {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    SixtyMinutes,
    Daily,
}

impl BarInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BarInterval::OneMinute => "1m",
            BarInterval::FiveMinutes => "5m",
            BarInterval::FifteenMinutes => "15m",
            BarInterval::ThirtyMinutes => "30m",
            BarInterval::SixtyMinutes => "60m",
            BarInterval::Daily => "daily",
        }
    }

    /// Minutes per bar, `None` for daily bars.
    pub fn minutes(&self) -> Option<u32> {
        match self {
            BarInterval::OneMinute => Some(1),
            BarInterval::FiveMinutes => Some(5),
            BarInterval::FifteenMinutes => Some(15),
            BarInterval::ThirtyMinutes => Some(30),
            BarInterval::SixtyMinutes => Some(60),
            BarInterval::Daily => None,
        }
    }
}

impl fmt::Display for BarInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BarInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "1m" | "1" => Ok(BarInterval::OneMinute),
            "5m" | "5" => Ok(BarInterval::FiveMinutes),
            "15m" | "15" => Ok(BarInterval::FifteenMinutes),
            "30m" | "30" => Ok(BarInterval::ThirtyMinutes),
            "60m" | "60" | "1h" => Ok(BarInterval::SixtyMinutes),
            "daily" | "1d" | "d" => Ok(BarInterval::Daily),
            other => Err(format!(
                "unsupported interval '{}', expected one of 1m,5m,15m,30m,60m,daily",
                other
            )),
        }
    }
}

impl<'de> Deserialize<'de> for BarInterval {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for BarInterval {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_parsing() {
        assert_eq!("60m".parse::<BarInterval>().unwrap(), BarInterval::SixtyMinutes);
        assert_eq!("Daily".parse::<BarInterval>().unwrap(), BarInterval::Daily);
        assert!("7m".parse::<BarInterval>().is_err());
    }

    #[test]
    fn test_interval_minutes() {
        assert_eq!(BarInterval::FifteenMinutes.minutes(), Some(15));
        assert_eq!(BarInterval::Daily.minutes(), None);
    }

    #[test]
    fn test_swapped_range() {
        let bar = Bar {
            timestamp: NaiveDateTime::parse_from_str("2025-09-03 10:00:00", "%Y-%m-%d %H:%M:%S").unwrap(),
            open: 10.0,
            high: 9.0,
            low: 11.0,
            close: 10.0,
            volume: 1.0,
            open_interest: None,
        };
        assert_eq!(bar.range(), (9.0, 11.0));
    }
}
