use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use crate::models::{Bar, BarInterval};

#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("bad response: {0}")]
    BadResponse(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("symbol not found: {0}")]
    NotFound(String),

    #[error("no data in range for {0}")]
    Empty(String),

    #[error("rate limited")]
    RateLimited,
}

impl MarketDataError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MarketDataError::Network(_) | MarketDataError::Timeout(_) | MarketDataError::RateLimited
        )
    }
}

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Bars for `code` from `start` (inclusive) to `end` (inclusive), oldest first.
    async fn fetch_bars(
        &self,
        code: &str,
        start: NaiveDate,
        end: NaiveDate,
        interval: BarInterval,
    ) -> Result<Vec<Bar>, MarketDataError>;

    fn name(&self) -> &'static str;
}

/// Sort by timestamp and drop repeated timestamps, keeping the last one seen.
pub fn normalize_bars(mut bars: Vec<Bar>) -> Vec<Bar> {
    bars.sort_by_key(|b| b.timestamp);
    let mut out: Vec<Bar> = Vec::with_capacity(bars.len());
    for bar in bars {
        match out.last_mut() {
            Some(last) if last.timestamp == bar.timestamp => *last = bar,
            _ => out.push(bar),
        }
    }
    out
}

/// Keep bars whose date lies in `[start, end]`.
pub fn clip_to_range(bars: Vec<Bar>, start: NaiveDate, end: NaiveDate) -> Vec<Bar> {
    bars.into_iter()
        .filter(|b| {
            let d = b.timestamp.date();
            d >= start && d <= end
        })
        .collect()
}
