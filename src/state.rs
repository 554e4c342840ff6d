use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::info;
use uuid::Uuid;

use crate::config::{PipelineConfig, SourceKind};
use crate::errors::PipelineError;
use crate::external::csv_source::CsvDirectorySource;
use crate::external::market_data::MarketDataSource;
use crate::external::sina::SinaFuturesSource;
use crate::services::publish_service::Publisher;
use crate::services::rate_limiter::RateLimiter;
use crate::services::sync_service::SyncService;

/// Shared handles for one pipeline run.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<PipelineConfig>,
    pub source: Arc<dyn MarketDataSource>,
    pub sync: Option<Arc<SyncService>>,
    pub publisher: Publisher,
    pub run_id: Uuid,
    /// Exchange-local date the run is stamped with.
    pub run_date: NaiveDate,
}

impl PipelineContext {
    pub fn from_config(config: PipelineConfig) -> Result<Self, PipelineError> {
        let source: Arc<dyn MarketDataSource> = match config.source.kind {
            SourceKind::Sina => {
                let limiter = Arc::new(RateLimiter::new(
                    config.max_parallel,
                    config.source.requests_per_minute,
                ));
                Arc::new(SinaFuturesSource::new(
                    &config.source.base_url,
                    config.source.timeout_secs,
                    limiter,
                )?)
            }
            SourceKind::CsvDir => Arc::new(CsvDirectorySource::new(config.csv_source_dir())),
        };

        let sync = SyncService::from_config(&config.sync, config.render.precision)?.map(Arc::new);
        let run_date = Utc::now().with_timezone(&config.timezone.0).date_naive();

        info!(
            "⚙️ Source: {}, sync: {}, run date {}",
            source.name(),
            if sync.is_some() { "on" } else { "off" },
            run_date
        );

        Ok(Self::new(config, source, sync, run_date))
    }

    /// Assemble a context from parts. Tests use this to plug in fake sources.
    pub fn new(
        config: PipelineConfig,
        source: Arc<dyn MarketDataSource>,
        sync: Option<Arc<SyncService>>,
        run_date: NaiveDate,
    ) -> Self {
        let publisher = Publisher::new(config.pages_root.clone(), config.publish.keep_dated);
        Self {
            config: Arc::new(config),
            source,
            sync,
            publisher,
            run_id: Uuid::new_v4(),
            run_date,
        }
    }

    /// Drop sync for this run, regardless of configuration.
    pub fn without_sync(mut self) -> Self {
        self.sync = None;
        self
    }
}
