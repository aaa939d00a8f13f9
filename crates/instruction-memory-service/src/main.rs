use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use instruction_memory_projector::{Projector, ProjectorConfig};
use instruction_memory_promoter::{Promoter, PromoterConfig};
use instruction_memory_store_sqlite::{MessageLog, ProjectionStore, PromoterStore};
use tokio::sync::watch;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "instruction-memory-service")]
#[command(about = "Promoter, projector, and replay host for the instruction memory")]
struct Cli {
    #[command(flatten)]
    stores: StoreArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct StoreArgs {
    /// Message log database (EVENTS, DELTAS, AUDITS streams).
    #[arg(long, default_value = "./im_log.sqlite3")]
    log_db: PathBuf,
    /// Promoter-owned database (items, versions, seen ledger, audit).
    #[arg(long, default_value = "./im_promoter.sqlite3")]
    promoter_db: PathBuf,
    /// Projection database (current, history, source bindings).
    #[arg(long, default_value = "./im_projection.sqlite3")]
    projection_db: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the promoter and projector workers until interrupted.
    Run {
        #[arg(long, default_value = "promoter-1.0.0")]
        policy_version: String,
        #[arg(long, default_value = "promoter-main")]
        promoter_durable: String,
        #[arg(long, default_value = "delta-projector")]
        projector_durable: String,
        #[arg(long, default_value_t = 250)]
        poll_interval_ms: u64,
    },
    /// Rebuild one namespace from the delta log and print the result.
    Replay {
        #[arg(long)]
        ns: String,
        #[arg(long)]
        max_seq: Option<i64>,
        /// Write the rebuilt projection here instead of a throwaway file.
        #[arg(long)]
        out_db: Option<PathBuf>,
    },
    /// Replay one namespace and compare it against the live projection.
    Verify {
        #[arg(long)]
        ns: String,
    },
}

/// Explicit configuration for the worker host, built once at startup.
#[derive(Debug, Clone)]
struct ServiceConfig {
    stores: StoreArgs,
    policy_version: String,
    promoter_durable: String,
    projector_durable: String,
    poll_interval: Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder().with_default_directive(LevelFilter::INFO.into()).from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { policy_version, promoter_durable, projector_durable, poll_interval_ms } => {
            let config = ServiceConfig {
                stores: cli.stores,
                policy_version,
                promoter_durable,
                projector_durable,
                poll_interval: Duration::from_millis(poll_interval_ms),
            };
            run_workers(config).await
        }
        Command::Replay { ns, max_seq, out_db } => replay_command(&cli.stores, &ns, max_seq, out_db),
        Command::Verify { ns } => verify_command(&cli.stores, &ns),
    }
}

async fn run_workers(config: ServiceConfig) -> Result<()> {
    let promoter = Promoter::new(
        MessageLog::open(&config.stores.log_db)?,
        PromoterStore::open(&config.stores.promoter_db)?,
        PromoterConfig {
            policy_version: config.policy_version.clone(),
            durable: config.promoter_durable.clone(),
        },
    );
    let projector = Projector::new(
        MessageLog::open(&config.stores.log_db)?,
        ProjectionStore::open(&config.stores.projection_db)?,
        ProjectorConfig { durable: config.projector_durable.clone() },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let promoter_task = tokio::spawn(instruction_memory_promoter::run(
        promoter,
        shutdown_rx.clone(),
        config.poll_interval,
    ));
    let projector_task = tokio::spawn(instruction_memory_projector::run(
        projector,
        shutdown_rx,
        config.poll_interval,
    ));

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    shutdown_tx.send(true).context("failed to signal shutdown")?;

    promoter_task.await.context("promoter task panicked")??;
    projector_task.await.context("projector task panicked")??;
    Ok(())
}

fn replay_command(
    stores: &StoreArgs,
    ns: &str,
    max_seq: Option<i64>,
    out_db: Option<PathBuf>,
) -> Result<()> {
    let log = MessageLog::open(&stores.log_db)?;

    let throwaway = out_db.is_none();
    let target = out_db
        .unwrap_or_else(|| std::env::temp_dir().join(format!("im-replay-{}.sqlite3", ulid::Ulid::new())));
    let mut projection = ProjectionStore::open_for_replay(&target)?;

    let result = instruction_memory_projector::replay(&log, &mut projection, ns, max_seq)?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if throwaway {
        let _ = std::fs::remove_file(&target);
    }
    Ok(())
}

fn verify_command(stores: &StoreArgs, ns: &str) -> Result<()> {
    let log = MessageLog::open(&stores.log_db)?;
    let live = ProjectionStore::open(&stores.projection_db)?;
    let live_snapshot = live.state_snapshot(ns)?;

    let target = std::env::temp_dir().join(format!("im-verify-{}.sqlite3", ulid::Ulid::new()));
    let mut fresh = ProjectionStore::open_for_replay(&target)?;
    let result = instruction_memory_projector::replay(&log, &mut fresh, ns, None)?;
    let _ = std::fs::remove_file(&target);

    let matches = result.state_hash == live_snapshot.state_hash
        && result.active_count == live_snapshot.active_count;

    let report = serde_json::json!({
        "ns": ns,
        "live": {
            "active_count": live_snapshot.active_count,
            "state_hash": live_snapshot.state_hash,
        },
        "replay": {
            "events_processed": result.events_processed,
            "active_count": result.active_count,
            "state_hash": result.state_hash,
            "elapsed_ms": result.elapsed_ms,
        },
        "matches": matches,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !matches {
        std::process::exit(1);
    }
    Ok(())
}
