use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use chipzones::config::PipelineConfig;
use chipzones::jobs::chipzones_job::{run_all, select_symbols};
use chipzones::logging::{init_logging, LoggingConfig};
use chipzones::state::PipelineContext;

#[derive(Parser, Debug)]
#[command(version, about = "Chip-zone charts and tables for futures contracts")]
struct Args {
    /// Path to config file.
    #[arg(long, short, default_value = "config.yaml")]
    config: PathBuf,
    /// Only run these symbols (repeatable).
    #[arg(long = "only", value_name = "CODE")]
    only: Vec<String>,
    /// Skip document database sync for this run.
    #[arg(long)]
    no_sync: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let logging = match init_logging(LoggingConfig::from_env()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialise logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("💥 {:#}", e);
            ExitCode::FAILURE
        }
    };

    logging.shutdown().await;
    code
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let config = PipelineConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let symbols = select_symbols(&config, &args.only)?;

    let mut ctx = PipelineContext::from_config(config).context("setting up pipeline")?;
    if args.no_sync {
        ctx = ctx.without_sync();
    }

    let report = run_all(&ctx, symbols).await;
    for line in report.summary_lines() {
        tracing::warn!("{}", line);
    }

    if report.all_failed() {
        tracing::error!("All {} symbol(s) failed", report.items_failed);
    }
    Ok(report.exit_code())
}
