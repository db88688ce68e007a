use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use adit_sync::{IngestCoordinator, IngestPipeline, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "adit-cli")]
#[command(about = "Admissions data ingestion tracker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Incremental pull: scrape records newer than the stored watermark and
    /// load them.
    Refresh,
    /// Full sweep of the board with no incremental bounds.
    Backfill,
    /// Stream an existing NDJSON artifact into the admissions table.
    Load {
        #[arg(long)]
        file: PathBuf,
    },
    /// Serve the trigger/status endpoints.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Refresh) {
        Commands::Refresh => {
            let pipeline = IngestPipeline::new(config)?;
            let summary = pipeline.run_refresh().await?;
            println!(
                "refresh complete: run_id={} status={:?} scraped={} inserted={}",
                summary.run_id, summary.status, summary.records_scraped, summary.records_inserted
            );
        }
        Commands::Backfill => {
            let pipeline = IngestPipeline::new(config)?;
            let summary = pipeline.run_backfill().await?;
            println!(
                "backfill complete: run_id={} scraped={} inserted={}",
                summary.run_id, summary.records_scraped, summary.records_inserted
            );
        }
        Commands::Load { file } => {
            let store = adit_store::AdmissionsStore::connect_lazy(&config.database_url)?;
            let inserted = store.load_jsonl(&file).await?;
            println!("load complete: inserted={inserted}");
        }
        Commands::Serve => {
            let pipeline = IngestPipeline::new(config)?;
            let coordinator = Arc::new(IngestCoordinator::new(Arc::new(pipeline)));
            adit_web::serve(coordinator).await?;
        }
    }

    Ok(())
}
