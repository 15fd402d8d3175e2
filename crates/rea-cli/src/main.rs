use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rea_alerts::{notifier_for, AlertConfig, AlertPipeline, AlertScheduler};
use rea_storage::{MemoryStore, PgStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rea-cli")]
#[command(about = "Saved-search alert job for the listing platform")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Match listings from the last 24 hours and send alerts once.
    RunOnce {
        /// Treat this instant as "now" (RFC 3339).
        #[arg(long)]
        at: Option<DateTime<Utc>>,
        /// Read listings and searches from a YAML fixture instead of Postgres.
        #[arg(long)]
        fixture: Option<PathBuf>,
        /// Log alerts instead of sending them.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the daily job on its cron schedule until Ctrl-C.
    Schedule {
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply database migrations.
    Migrate,
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("building log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| anyhow!("installing log subscriber: {err}"))
}

async fn build_pipeline(
    config: &AlertConfig,
    fixture: Option<PathBuf>,
    dry_run: bool,
) -> Result<AlertPipeline> {
    let notifier = notifier_for(config, dry_run)?;
    let pipeline = match fixture {
        Some(path) => {
            let store = Arc::new(MemoryStore::from_fixture_file(&path).await?);
            info!(fixture = %path.display(), "using fixture store");
            AlertPipeline::new(store.clone(), store, notifier, config.settings())
        }
        None => {
            let store = Arc::new(
                PgStore::connect(&config.database_url)
                    .await
                    .context("connecting to database")?,
            );
            AlertPipeline::new(store.clone(), store, notifier, config.settings())
        }
    };
    Ok(pipeline)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;
    let cli = Cli::parse();
    let config = AlertConfig::from_env()?;

    let command = cli.command.unwrap_or(Commands::RunOnce {
        at: None,
        fixture: None,
        dry_run: false,
    });

    match command {
        Commands::RunOnce {
            at,
            fixture,
            dry_run,
        } => {
            let pipeline = build_pipeline(&config, fixture, dry_run).await?;
            let summary = match at {
                Some(now) => pipeline.run_at(now).await?,
                None => pipeline.run_once().await?,
            };
            println!(
                "alert run complete: run_id={} listings={} failed_listings={} matches={} sent={} delivery_failures={}",
                summary.run_id,
                summary.listings_scanned,
                summary.listings_failed,
                summary.matches_found,
                summary.notifications_sent,
                summary.delivery_failures
            );
        }
        Commands::Schedule { dry_run } => {
            let pipeline = Arc::new(build_pipeline(&config, None, dry_run).await?);
            let mut scheduler = AlertScheduler::new(pipeline, config.schedule.clone());
            scheduler.start().await?;
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            scheduler.stop().await?;
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}
