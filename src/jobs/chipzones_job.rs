//! Chip-zone run over every configured symbol.
//!
//! # Processing Strategy
//!
//! For each symbol, independently:
//! 1. Fetch bars from the configured source (retried, per-attempt timeout)
//! 2. Archive the raw bars under `data_dir` when the source is remote
//! 3. Build the volume-at-price profile, zones and accumulation lines
//! 4. Render chart and table in memory
//! 5. Publish both atomically under `pages_root`
//! 6. Upsert the document-database row, if sync is on
//!
//! # Error Handling
//!
//! - A failing symbol never stops the others
//! - Sync failures are logged and reported but leave the symbol successful
//! - The run only counts as failed when every symbol failed

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use tracing::{error, info, info_span, warn, Instrument, Span};

use crate::config::{PipelineConfig, SourceKind};
use crate::errors::{ConfigError, PipelineError, Stage};
use crate::models::{Artifact, Bar, ChipProfile, ChipZones, SymbolConfig};
use crate::services::accumulation_service::accumulation_strength;
use crate::services::chip_zone_service::{estimate_zones, ZoneParams};
use crate::services::fetch_service::{fetch_with_retry, RetryPolicy};
use crate::services::publish_service::archive_raw_bars;
use crate::services::render_service::{render_artifact, RenderInput};
use crate::services::volume_profile_service::{build_profile, ProfileParams};
use crate::state::PipelineContext;

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolFailure {
    pub symbol: String,
    pub stage: Stage,
    pub cause: String,
}

impl SymbolFailure {
    fn new(symbol: &str, error: &PipelineError) -> Self {
        Self {
            symbol: symbol.to_string(),
            stage: error.stage(),
            cause: error.to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub items_processed: usize,
    pub items_failed: usize,
    pub failures: Vec<SymbolFailure>,
    /// Recovered problems, such as a sync error after a successful publish.
    pub warnings: Vec<SymbolFailure>,
}

impl RunReport {
    pub fn all_failed(&self) -> bool {
        self.items_failed > 0 && self.items_processed == 0
    }

    /// Process status for the run: failure only when no symbol got through.
    pub fn exit_code(&self) -> ExitCode {
        if self.all_failed() {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        }
    }

    /// One line per failed symbol, then one per recovered warning.
    pub fn summary_lines(&self) -> Vec<String> {
        let failed = self
            .failures
            .iter()
            .map(|f| format!("FAILED {} [{}]: {}", f.symbol, f.stage, f.cause));
        let warned = self
            .warnings
            .iter()
            .map(|f| format!("WARN {} [{}]: {}", f.symbol, f.stage, f.cause));
        failed.chain(warned).collect()
    }
}

/// What a successful symbol left behind.
#[derive(Debug)]
pub struct SymbolOutcome {
    pub published: Vec<PathBuf>,
    pub sync_error: Option<PipelineError>,
}

/// Configured symbols, narrowed to `only` when it is non-empty.
pub fn select_symbols(config: &PipelineConfig, only: &[String]) -> Result<Vec<SymbolConfig>, ConfigError> {
    let all = config.symbol_configs();
    if only.is_empty() {
        return Ok(all);
    }

    let wanted: Vec<String> = only.iter().map(|c| c.trim().to_uppercase()).collect();
    if let Some(unknown) = wanted.iter().find(|c| !all.iter().any(|s| &s.code == *c)) {
        return Err(ConfigError::invalid(
            "--only",
            format!("'{}' is not a configured symbol", unknown),
        ));
    }
    Ok(all.into_iter().filter(|s| wanted.contains(&s.code)).collect())
}

/// Run every symbol with at most `max_parallel` in flight.
pub async fn run_all(ctx: &PipelineContext, symbols: Vec<SymbolConfig>) -> RunReport {
    info!(
        "🚀 Starting chip-zone run {} for {} symbol(s), up to {} in parallel",
        ctx.run_id,
        symbols.len(),
        ctx.config.max_parallel
    );

    let results: Vec<(String, Result<SymbolOutcome, PipelineError>)> = stream::iter(symbols)
        .map(|symbol| {
            let span = info_span!("symbol", symbol = %symbol.code, run_id = %ctx.run_id);
            async move {
                let result = run_symbol(ctx, &symbol).await;
                (symbol.code, result)
            }
            .instrument(span)
        })
        .buffer_unordered(ctx.config.max_parallel.max(1))
        .collect()
        .await;

    let mut report = RunReport::default();
    for (symbol, result) in results {
        match result {
            Ok(outcome) => {
                report.items_processed += 1;
                if let Some(e) = outcome.sync_error {
                    report.warnings.push(SymbolFailure::new(&symbol, &e));
                }
            }
            Err(e) => {
                report.items_failed += 1;
                report.failures.push(SymbolFailure::new(&symbol, &e));
            }
        }
    }
    report.failures.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    report.warnings.sort_by(|a, b| a.symbol.cmp(&b.symbol));

    prune_unlisted(ctx).await;
    refresh_directory(ctx).await;

    info!(
        "✅ Chip-zone run {} completed: {} processed, {} failed",
        ctx.run_id, report.items_processed, report.items_failed
    );
    report
}

/// Full pipeline for one symbol. Errors carry the stage they happened in.
pub async fn run_symbol(ctx: &PipelineContext, symbol: &SymbolConfig) -> Result<SymbolOutcome, PipelineError> {
    let config = &ctx.config;
    let policy = RetryPolicy::from(&config.source);

    let bars = fetch_with_retry(ctx.source.as_ref(), symbol, ctx.run_date, &policy).await?;

    if config.source.archive_raw && config.source.kind == SourceKind::Sina {
        match archive_raw_bars(&config.data_dir, symbol, ctx.run_date, &bars) {
            Ok(path) => info!("🗄️ Archived raw bars to {}", path.display()),
            Err(e) => warn!("Could not archive raw bars for {}: {}", symbol.code, e),
        }
    }

    // Binning and drawing are CPU-bound; keep them off the async workers.
    let shared = ctx.config.clone();
    let code = symbol.code.clone();
    let run_date = ctx.run_date;
    let span = Span::current();
    let (artifact, profile, zones) = tokio::task::spawn_blocking(move || {
        span.in_scope(|| analyse_and_render(&code, &bars, &shared, run_date))
    })
    .await
    .map_err(|e| PipelineError::Render(format!("render task failed: {}", e)))??;

    let published = ctx.publisher.publish(&artifact)?;

    let sync_error = match &ctx.sync {
        Some(sync) => match sync.sync_symbol(&artifact, &profile, &zones).await {
            Ok(_) => None,
            Err(e) => {
                let e = PipelineError::from(e);
                error!("❌ Sync failed for {} (artifacts stay published): {}", symbol.code, e);
                Some(e)
            }
        },
        None => None,
    };

    Ok(SymbolOutcome { published, sync_error })
}

fn analyse_and_render(
    code: &str,
    bars: &[Bar],
    config: &PipelineConfig,
    run_date: NaiveDate,
) -> Result<(Artifact, ChipProfile, ChipZones), PipelineError> {
    let analysis = &config.analysis;

    let profile = build_profile(bars, &ProfileParams::from(analysis))?;
    let zones = estimate_zones(bars, &profile, &ZoneParams::from(analysis));
    let accumulation = accumulation_strength(bars, analysis.window_strength, analysis.smooth);

    info!(
        "📊 {}: {} bars, {} bins, {} zone bin(s)",
        code,
        bars.len(),
        profile.len(),
        zones.zone_count()
    );

    let artifact = render_artifact(
        &RenderInput {
            symbol: code,
            bars,
            profile: &profile,
            zones: &zones,
            accumulation: &accumulation,
        },
        &config.render,
        run_date,
    )?;
    Ok((artifact, profile, zones))
}

async fn prune_unlisted(ctx: &PipelineContext) {
    let Some(sync) = &ctx.sync else { return };
    if !sync.prune_enabled() {
        return;
    }

    let listed: Vec<String> = ctx.config.symbol_configs().into_iter().map(|s| s.code).collect();
    if let Err(e) = sync.prune_unlisted(&listed).await {
        warn!("Pruning unlisted rows failed: {}", e);
    }
}

async fn refresh_directory(ctx: &PipelineContext) {
    let Some(sync) = &ctx.sync else { return };
    if !sync.directory_enabled() {
        return;
    }

    let listed: Vec<String> = ctx.config.symbol_configs().into_iter().map(|s| s.code).collect();
    if let Err(e) = sync.refresh_directory(&listed).await {
        warn!("Refreshing the directory page failed: {}", e);
    }
}
