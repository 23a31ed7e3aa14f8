use std::future::Future;
use std::path::PathBuf;

use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use wikigaps_core::iso8601;
use wikigaps_sync::{
    checkpoint_status, CollectPipeline, CollectSummary, MaterializePipeline, MaterializeSummary,
    SyncConfig,
};

#[derive(Debug, Parser)]
#[command(name = "wikigaps", version)]
#[command(
    about = "Incremental collection of new biography articles and their knowledge-base attributes"
)]
struct Cli {
    /// Data directory.
    #[arg(long, global = true, env = "WIKIGAPS_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[arg(long, default_value = "text", global = true)]
    log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Debug, clap::ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Discover new records since the checkpoint and persist entities and creations.
    Collect,
    /// Resolve labels and write the normalized, seed and snapshot artifacts.
    Materialize,
    /// Collect, then materialize.
    Refresh,
    /// Show the stored watermark and the next query window.
    Checkpoint,
}

fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = match cli.verbose {
        0 => "wikigaps=info,wikigaps_sync=info,wikigaps_storage=warn,wikigaps_adapters=warn",
        1 => "wikigaps=debug,wikigaps_sync=debug,wikigaps_storage=info,wikigaps_adapters=info",
        _ => "wikigaps=trace,wikigaps_sync=trace,wikigaps_storage=debug,wikigaps_adapters=debug",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => fmt().with_env_filter(env_filter).with_target(false).init(),
        LogFormat::Json => fmt().json().with_env_filter(env_filter).init(),
    }
}

fn print_collect(summary: &CollectSummary) {
    println!(
        concat!(
            "collect {:?}: run_id={} since={} discovered={} biography_like={} linked={} ",
            "entities={} creations={} entity_rows={} creation_rows={} watermark={}",
        ),
        summary.outcome,
        summary.run_id,
        summary.window_since,
        summary.discovered,
        summary.biography_like,
        summary.linked,
        summary.entities_resolved,
        summary.creations_resolved,
        summary.entity_rows,
        summary.creation_rows,
        summary.new_watermark.as_deref().unwrap_or("unchanged"),
    );
}

fn print_materialize(summary: &MaterializeSummary) {
    println!(
        concat!(
            "materialize: run_id={} entities={} labels_fetched={} cache_hits={} ",
            "normalized={} seed={} malformed={} manifest={}",
        ),
        summary.run_id,
        summary.entities,
        summary.labels_fetched,
        summary.label_cache_hits,
        summary.normalized_rows,
        summary.seed_rows,
        summary.seed_malformed,
        summary.snapshot_manifest,
    );
}

async fn run(command: Commands, config: SyncConfig) -> Result<()> {
    match command {
        Commands::Collect => {
            let summary = CollectPipeline::new(&config)?.run_once().await?;
            print_collect(&summary);
        }
        Commands::Materialize => {
            let summary = MaterializePipeline::new(&config)?.run_once().await?;
            print_materialize(&summary);
        }
        Commands::Refresh => {
            let collected = CollectPipeline::new(&config)?.run_once().await?;
            print_collect(&collected);
            let materialized = MaterializePipeline::new(&config)?.run_once().await?;
            print_materialize(&materialized);
        }
        Commands::Checkpoint => {
            let status = checkpoint_status(&config, Utc::now()).await?;
            if !status.stored {
                warn!(
                    path = %status.path.display(),
                    "no checkpoint stored yet; showing the default"
                );
            }
            println!(
                "checkpoint {}: last_run_ts={} next window {}",
                status.path.display(),
                iso8601::format(&status.window.checkpoint),
                status.window,
            );
        }
    }
    Ok(())
}

/// Run `work` until it finishes or Ctrl-C arrives. Artifacts are replaced atomically
/// and the checkpoint moves last, so an interrupted run can be repeated as is.
async fn until_interrupted(work: impl Future<Output = Result<()>>) -> Result<()> {
    tokio::select! {
        result = work => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; checkpoint left at its previous value");
            bail!("interrupted")
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let mut config = SyncConfig::from_env();
    if let Some(data_dir) = cli.data_dir.clone() {
        config = config.with_data_dir(data_dir);
    }
    info!(data_dir = %config.data_dir.display(), "wikigaps starting");

    until_interrupted(run(cli.command.unwrap_or(Commands::Collect), config)).await
}
