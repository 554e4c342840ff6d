use chrono::NaiveDate;
use tokio::time::{sleep, timeout, Duration};
use tracing::{error, info, warn};

use crate::config::SourceConfig;
use crate::external::market_data::{MarketDataError, MarketDataSource};
use crate::models::{Bar, SymbolConfig};

/// Attempt budget for one symbol's history download.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Applied to each attempt separately.
    pub attempt_timeout: Duration,
    /// First backoff; doubles after every failed attempt.
    pub backoff: Duration,
    /// Add up to 25% random delay to each backoff.
    pub jitter: bool,
}

impl From<&SourceConfig> for RetryPolicy {
    fn from(config: &SourceConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            attempt_timeout: Duration::from_secs(config.timeout_secs),
            backoff: Duration::from_millis(config.backoff_ms),
            jitter: true,
        }
    }
}

/// Fetch `symbol` from its start date through `end`, retrying transient failures.
///
/// Not-found, empty and malformed responses fail immediately; network errors,
/// timeouts and throttling are retried up to `max_attempts` in total.
pub async fn fetch_with_retry(
    source: &dyn MarketDataSource,
    symbol: &SymbolConfig,
    end: NaiveDate,
    policy: &RetryPolicy,
) -> Result<Vec<Bar>, MarketDataError> {
    let mut attempt = 0;
    let mut delay = policy.backoff;

    loop {
        attempt += 1;
        let result = timeout(
            policy.attempt_timeout,
            source.fetch_bars(&symbol.code, symbol.start_date, end, symbol.interval),
        )
        .await
        .unwrap_or(Err(MarketDataError::Timeout(policy.attempt_timeout.as_secs())));

        match result {
            Ok(bars) => {
                info!(
                    "📥 {} bars for {} from {} ({} → {})",
                    bars.len(),
                    symbol.code,
                    source.name(),
                    symbol.start_date,
                    end
                );
                return Ok(bars);
            }
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let wait = if policy.jitter {
                    delay.mul_f64(1.0 + rand::random::<f64>() * 0.25)
                } else {
                    delay
                };
                warn!(
                    "Fetching {} failed (attempt {}/{}): {}. Retrying in {:?}...",
                    symbol.code, attempt, policy.max_attempts, e, wait
                );
                sleep(wait).await;
                delay *= 2;
            }
            Err(e) => {
                error!(
                    "Fetching {} from {} failed after {} attempt(s): {}",
                    symbol.code,
                    source.name(),
                    attempt,
                    e
                );
                return Err(e);
            }
        }
    }
}
