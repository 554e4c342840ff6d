use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::external::market_data::{clip_to_range, normalize_bars, MarketDataError, MarketDataSource};
use crate::models::{Bar, BarInterval};
use crate::services::rate_limiter::RateLimiter;

/// Sina Finance futures K-line feed (the JSONP endpoint behind the futures quote pages).
///
/// Minute bars come from `getFewMinLine`, which only serves a trailing window, so
/// the result is clipped to the requested range afterwards. Daily bars come from
/// `getDailyKLine`.
pub struct SinaFuturesSource {
    client: reqwest::Client,
    base_url: String,
    timeout_secs: u64,
    rate_limiter: Arc<RateLimiter>,
}

impl SinaFuturesSource {
    pub fn new(
        base_url: &str,
        timeout_secs: u64,
        rate_limiter: Arc<RateLimiter>,
    ) -> Result<Self, MarketDataError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("Mozilla/5.0 (X11; Linux x86_64) chipzones")
            .build()
            .map_err(|e| MarketDataError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_secs,
            rate_limiter,
        })
    }

    fn endpoint(&self, interval: BarInterval) -> String {
        match interval {
            BarInterval::Daily => format!("{}/=/InnerFuturesNewService.getDailyKLine", self.base_url),
            _ => format!("{}/=/InnerFuturesNewService.getFewMinLine", self.base_url),
        }
    }
}

/// One K-line row. Sina sends numbers as strings.
#[derive(Debug, Deserialize)]
struct SinaKLine {
    d: String,
    o: Value,
    h: Value,
    l: Value,
    c: Value,
    v: Value,
    #[serde(default)]
    p: Option<Value>,
}

#[async_trait]
impl MarketDataSource for SinaFuturesSource {
    async fn fetch_bars(
        &self,
        code: &str,
        start: NaiveDate,
        end: NaiveDate,
        interval: BarInterval,
    ) -> Result<Vec<Bar>, MarketDataError> {
        let _guard = self.rate_limiter.acquire().await;

        let mut query: Vec<(&str, String)> = vec![("symbol", code.to_string())];
        if let Some(minutes) = interval.minutes() {
            query.push(("type", minutes.to_string()));
        }

        debug!("GET {} symbol={} interval={}", self.endpoint(interval), code, interval);

        let resp = self
            .client
            .get(self.endpoint(interval))
            .query(&query)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MarketDataError::Timeout(self.timeout_secs)
                } else {
                    MarketDataError::Network(e.to_string())
                }
            })?;

        let status = resp.status();
        // Sina answers 456 when it throttles a client.
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 456 {
            return Err(MarketDataError::RateLimited);
        }
        if !status.is_success() {
            return Err(MarketDataError::BadResponse(format!("HTTP {}", status)));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| MarketDataError::Network(e.to_string()))?;

        let rows = parse_jsonp(&body, code)?;
        let bars = rows
            .into_iter()
            .map(|row| row.into_bar(interval))
            .collect::<Result<Vec<_>, _>>()?;

        let bars = clip_to_range(normalize_bars(bars), start, end);
        if bars.is_empty() {
            return Err(MarketDataError::Empty(code.to_string()));
        }
        Ok(bars)
    }

    fn name(&self) -> &'static str {
        "sina"
    }
}

/// Extract the JSON array from a `...=( [...] );` JSONP wrapper.
fn parse_jsonp(body: &str, code: &str) -> Result<Vec<SinaKLine>, MarketDataError> {
    let open = body
        .find("=(")
        .map(|i| i + 2)
        .ok_or_else(|| MarketDataError::Parse("missing JSONP wrapper".into()))?;
    let close = body
        .rfind(')')
        .filter(|&i| i >= open)
        .ok_or_else(|| MarketDataError::Parse("unterminated JSONP wrapper".into()))?;
    let payload = body[open..close].trim();

    if payload.is_empty() || payload == "null" {
        return Err(MarketDataError::NotFound(code.to_string()));
    }

    serde_json::from_str::<Vec<SinaKLine>>(payload).map_err(|e| MarketDataError::Parse(e.to_string()))
}

fn number(value: &Value, field: &str) -> Result<f64, MarketDataError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| MarketDataError::Parse(format!("field {} is not numeric: {}", field, value)))
}

impl SinaKLine {
    fn into_bar(self, interval: BarInterval) -> Result<Bar, MarketDataError> {
        let timestamp = match interval {
            BarInterval::Daily => NaiveDate::parse_from_str(self.d.trim(), "%Y-%m-%d")
                .map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default())
                .map_err(|e| MarketDataError::Parse(format!("{}: {}", self.d, e)))?,
            _ => NaiveDateTime::parse_from_str(self.d.trim(), "%Y-%m-%d %H:%M:%S")
                .map_err(|e| MarketDataError::Parse(format!("{}: {}", self.d, e)))?,
        };

        Ok(Bar {
            timestamp,
            open: number(&self.o, "o")?,
            high: number(&self.h, "h")?,
            low: number(&self.l, "l")?,
            close: number(&self.c, "c")?,
            volume: number(&self.v, "v")?,
            open_interest: match &self.p {
                Some(p) => Some(number(p, "p")?),
                None => None,
            },
        })
    }
}
