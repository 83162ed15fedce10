use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use duende_core::StagedRecord;
use duende_storage::{PgStore, ReconcileStore};
use duende_sync::ReconcileConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "duende-cli")]
#[command(about = "Reconcile staged flamenco events into the canonical store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Drain the staging area once and print the run summary.
    Reconcile,
    /// Load a scraper export (JSON) into the staging area.
    Stage { path: PathBuf },
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("duende=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Reconcile) {
        Commands::Reconcile => {
            let summary = duende_sync::run_reconcile_once_from_env().await?;
            let events = &summary.events;
            println!(
                "reconcile complete: run_id={} events processed={} added={} duplicates={} invalid={} failed={} artists={}/{} venues={}/{} approximate={} unresolved={} structural_keys={} duration_ms={}",
                summary.run_id,
                events.processed,
                events.added,
                events.duplicates,
                events.invalid,
                events.failed,
                summary.artists.added,
                summary.artists.updated,
                summary.venues.added,
                summary.venues.updated,
                summary.geocoding.approximate,
                summary.geocoding.unresolved,
                summary.structural_keys,
                summary.duration_ms,
            );
        }
        Commands::Stage { path } => {
            let payloads = duende_adapters::load_staging_export(&path)?;
            let staged_at = Utc::now();
            let records = payloads
                .iter()
                .map(|payload| StagedRecord::new(payload, staged_at))
                .collect::<Result<Vec<_>, _>>()
                .context("encoding staged payloads")?;

            let config = ReconcileConfig::from_env()?;
            let store = PgStore::connect(&config.database_url).await?;
            let staged = store.stage_records(&records).await?;
            info!(path = %path.display(), staged, "staging export loaded");
            println!("staged {staged} records from {}", path.display());
        }
        Commands::Migrate => {
            let config = ReconcileConfig::from_env()?;
            let store = PgStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
