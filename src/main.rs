//! # ETL Worker Entry Point
//!
//! Runs the scheduler, reaper and claim loop against the configured database,
//! or applies the schema migrations and exits.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use etl_orchestrator::{
    config::ConfigLoader,
    db,
    ingestion::InMemoryIngestionReader,
    pipeline::ProcessorRegistry,
    telemetry,
    worker::Worker,
};

#[derive(Parser)]
#[command(name = "etl-worker", version, about = "ETL job orchestration worker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler, reaper and claim loop until interrupted (default)
    Run,
    /// Apply pending database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing telemetry")?;

    info!(profile = %config.profile, worker_id = %config.worker_id, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        info!(configuration = %redacted_json, "Effective configuration");
    }

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Migrate => {
            db::run_migrations(&db).await?;
        }
        Command::Run => {
            db::run_migrations(&db).await?;
            db::health_check(&db).await?;

            // Processors are registered by embedding crates; a bare worker
            // schedules and reaps but leases nothing.
            let registry = ProcessorRegistry::new();
            let reader = Arc::new(InMemoryIngestionReader::new());
            let worker = Worker::new(Arc::new(config), db, registry, reader);

            let shutdown = CancellationToken::new();
            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!("Shutdown signal received"),
                    Err(err) => warn!(error = ?err, "Failed to listen for shutdown signal"),
                }
                signal_token.cancel();
            });

            worker.run(shutdown).await;
        }
    }

    Ok(())
}
