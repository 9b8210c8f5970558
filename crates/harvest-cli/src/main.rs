use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use harvest_adapters::AdapterRegistry;
use harvest_storage::{MemoryRecordStore, PgRecordStore, RecordStore, RunFilter};
use harvest_sync::{build_dispatcher, build_scheduler, load_seed_file, seed_sources, SyncConfig};
use harvest_web::AppState;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "harvest")]
#[command(about = "Job posting ingestion and lifecycle tracking")]
struct Cli {
    /// Keep everything in memory instead of Postgres.
    #[arg(long, global = true)]
    ephemeral: bool,

    /// Seed sources from this YAML file before running the command.
    #[arg(long, global = true, value_name = "FILE")]
    seed: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Insert sources from a YAML file, skipping ones already present.
    Seed { file: PathBuf },
    /// One dispatch pass over due sources; waits for the spawned runs.
    Sync,
    /// Run one source now, regardless of its schedule.
    Scrape { source_id: Uuid },
    /// Dispatch on the configured cron until Ctrl-C.
    Schedule,
    /// Serve the JSON API, plus the scheduler when enabled.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,harvest=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let registry = AdapterRegistry::with_builtin();
    let store = open_store(&cli, &config).await?;

    if let Some(path) = &cli.seed {
        seed_from(store.as_ref(), &registry, path).await?;
    }

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Migrate => {
            if cli.ephemeral {
                println!("nothing to migrate for the in-memory store");
            } else {
                println!("migrations applied");
            }
        }
        Commands::Seed { file } => {
            seed_from(store.as_ref(), &registry, &file).await?;
        }
        Commands::Sync => {
            let dispatcher = build_dispatcher(&config, store.clone(), registry)?;
            let report = dispatcher
                .dispatch_due()
                .await
                .context("dispatching due sources")?;
            dispatcher.drain().await;
            println!(
                "sync complete: scanned={} dispatched={} not_due={} in_flight={} expired_runs={}",
                report.scanned,
                report.dispatched.len(),
                report.not_due,
                report.skipped_in_flight.len(),
                report.expired_runs
            );
        }
        Commands::Scrape { source_id } => {
            let dispatcher = build_dispatcher(&config, store.clone(), registry)?;
            let handle = dispatcher
                .trigger(source_id)
                .await
                .with_context(|| format!("triggering source {source_id}"))?;
            dispatcher.drain().await;
            let runs = store
                .list_runs(&RunFilter::for_source(source_id, 1))
                .await
                .context("loading run")?;
            match runs.first() {
                Some(run) => println!(
                    "scrape complete: task_id={} run_id={} status={} found={} new={} updated={} removed={}",
                    handle.task_id,
                    run.id,
                    run.status,
                    run.listings_found,
                    run.listings_new,
                    run.listings_updated,
                    run.listings_removed
                ),
                None => println!("scrape finished without a run: task_id={}", handle.task_id),
            }
        }
        Commands::Schedule => {
            let dispatcher = build_dispatcher(&config, store.clone(), registry)?;
            let mut sched = build_scheduler(dispatcher.clone(), &config.dispatch_cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.dispatch_cron, "scheduler running; Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
            dispatcher.drain().await;
        }
        Commands::Serve { port } => {
            let dispatcher = build_dispatcher(&config, store.clone(), registry)?;
            let _sched = if config.scheduler_enabled {
                let sched = build_scheduler(dispatcher.clone(), &config.dispatch_cron).await?;
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.dispatch_cron, "scheduler enabled");
                Some(sched)
            } else {
                None
            };
            let state = AppState::new(store.clone(), dispatcher);
            harvest_web::serve(state, port.unwrap_or(config.web_port)).await?;
        }
    }

    Ok(())
}

async fn open_store(cli: &Cli, config: &SyncConfig) -> Result<Arc<dyn RecordStore>> {
    if cli.ephemeral {
        return Ok(Arc::new(MemoryRecordStore::new()));
    }
    let store = PgRecordStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("running migrations")?;
    Ok(Arc::new(store))
}

async fn seed_from(
    store: &dyn RecordStore,
    registry: &AdapterRegistry,
    path: &Path,
) -> Result<()> {
    let seed = load_seed_file(path).await?;
    let report = seed_sources(store, registry, seed.sources, chrono::Utc::now()).await?;
    println!(
        "seed complete: inserted={} existing={} unknown_platform={}",
        report.inserted.len(),
        report.existing,
        report.unknown_platform
    );
    Ok(())
}
