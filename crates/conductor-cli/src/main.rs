//! CLI entry point for Conductor.
//!
//! This binary provides the `conductor` command: start a workflow, answer
//! the ones waiting for a human, and inspect what the workers recorded.
//! Every invocation shares state through one SQLite file, so a workflow
//! suspended by `ask` can be resolved by a later process.

mod cli;
mod helpers;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use conductor_agent::{Engine, EngineConfig, PendingStatus};
use conductor_store::{CheckpointStore, Database, SqliteCheckpointStore, SqliteTaskStore, TaskStore};
use tracing::info;

use crate::cli::{Action, Cli, Commands};
use crate::helpers::{decision_for, init_tracing, print_outcome, truncate};

const DEFAULT_DB_PATH: &str = "data/conductor.db";

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before the configuration reads the environment.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(if cli.verbose { "debug" } else { "info" });

    let mut config =
        EngineConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let db_path = prepare_db_path(&mut config)?;

    match cli.command {
        Commands::Ask {
            request,
            hitl,
            no_hitl,
        } => {
            if hitl {
                config.engine.enable_hitl = true;
            } else if no_hitl {
                config.engine.enable_hitl = false;
            }
            cmd_ask(config, request).await
        }
        Commands::Resolve {
            instance_id,
            action,
            text,
        } => cmd_resolve(config, &instance_id, action, text).await,
        Commands::Retry { instance_id } => cmd_retry(config, &instance_id).await,
        Commands::Pending => cmd_pending(&db_path).await,
        Commands::Cancel { instance_id } => cmd_cancel(&db_path, &instance_id).await,
        Commands::Tasks { worker_id, clear } => cmd_tasks(&db_path, worker_id, clear).await,
        Commands::Expire { hours } => {
            cmd_expire(&db_path, hours.unwrap_or(config.store.task_ttl_hours)).await
        }
        Commands::Workers => {
            cmd_workers(&config);
            Ok(())
        }
    }
}

/// The CLI always persists; fall back to `data/conductor.db` when no path
/// is configured.
fn prepare_db_path(config: &mut EngineConfig) -> Result<PathBuf> {
    let path = config
        .store
        .path
        .get_or_insert_with(|| PathBuf::from(DEFAULT_DB_PATH))
        .clone();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(path)
}

async fn open_db(path: &Path) -> Result<Database> {
    Database::open_and_migrate(path.to_path_buf())
        .await
        .with_context(|| format!("failed to open database {}", path.display()))
}

/// An engine with the pending table restored from disk.
async fn open_engine(config: EngineConfig) -> Result<Engine> {
    let engine = Engine::from_config(config)
        .await
        .context("failed to start the workflow engine")?;
    engine.recover().await.context("failed to recover pending workflows")?;
    Ok(engine)
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

async fn cmd_ask(config: EngineConfig, request: String) -> Result<()> {
    let engine = open_engine(config).await?;
    info!(hitl = engine.config().engine.enable_hitl, "starting workflow");
    let outcome = engine.start(request).await?;
    print_outcome(&outcome);
    Ok(())
}

async fn cmd_resolve(
    config: EngineConfig,
    instance_id: &str,
    action: Action,
    text: Option<String>,
) -> Result<()> {
    let engine = open_engine(config).await?;
    let Some(pending) = engine
        .pending()
        .into_iter()
        .find(|p| p.instance_id == instance_id)
    else {
        bail!("no pending workflow with id {instance_id}");
    };
    if pending.status == PendingStatus::Failed {
        bail!("workflow {instance_id} failed at {}; use `conductor retry`", pending.stage);
    }

    let decision = decision_for(pending.stage, action, text)?;
    let outcome = engine.resolve(instance_id, decision).await?;
    print_outcome(&outcome);
    Ok(())
}

async fn cmd_retry(config: EngineConfig, instance_id: &str) -> Result<()> {
    let engine = open_engine(config).await?;
    let outcome = engine.retry(instance_id).await?;
    print_outcome(&outcome);
    Ok(())
}

async fn cmd_pending(db_path: &Path) -> Result<()> {
    let checkpoints = SqliteCheckpointStore::new(open_db(db_path).await?);
    let records = checkpoints.list().await?;

    println!();
    if records.is_empty() {
        println!("  No pending workflows.");
        println!();
        return Ok(());
    }

    println!("  {:<38} {:<20} {:<16} UPDATED", "INSTANCE", "STAGE", "STATUS");
    for record in &records {
        println!(
            "  {:<38} {:<20} {:<16} {}",
            record.instance_id,
            record.stage,
            record.status,
            record.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(reason) = record.payload.get("reason").and_then(|r| r.as_str()) {
            println!("      {}", truncate(reason, 100));
        }
    }
    println!();
    Ok(())
}

async fn cmd_cancel(db_path: &Path, instance_id: &str) -> Result<()> {
    let checkpoints = SqliteCheckpointStore::new(open_db(db_path).await?);
    if !checkpoints.delete(instance_id).await? {
        bail!("no pending workflow with id {instance_id}");
    }
    println!("  Cancelled {instance_id}.");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tasks and workers
// ---------------------------------------------------------------------------

async fn cmd_tasks(db_path: &Path, worker_id: Option<String>, clear: bool) -> Result<()> {
    let tasks: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::new(open_db(db_path).await?));

    if clear {
        tasks.clear().await?;
        println!("  All tasks cleared.");
        return Ok(());
    }
    let Some(worker_id) = worker_id else {
        bail!("a worker id is required");
    };

    let list = tasks.list_by_worker(&worker_id).await?;
    println!();
    if list.is_empty() {
        println!("  No tasks recorded for {worker_id}.");
    }
    for task in &list {
        println!(
            "  {}  {:<10} {:<18} {}",
            task.start_time.format("%Y-%m-%d %H:%M"),
            format!("{:?}", task.status()).to_lowercase(),
            task.name,
            truncate(&task.description, 60)
        );
        if let Some(result) = task.result.as_deref().or(task.error.as_deref()) {
            println!("      -> {}", truncate(result, 100));
        }
    }
    println!();
    Ok(())
}

async fn cmd_expire(db_path: &Path, hours: u64) -> Result<()> {
    let tasks = SqliteTaskStore::new(open_db(db_path).await?);
    let removed = tasks.expire(hours).await?;
    println!("  Removed {removed} task(s) older than {hours}h.");
    Ok(())
}

fn cmd_workers(config: &EngineConfig) {
    println!();
    for worker in &config.workers {
        let role = if worker.id == config.engine.orchestrator {
            " (orchestrator)"
        } else {
            ""
        };
        println!("  {} -- {}{role}", worker.id, worker.name);
        if !worker.description.is_empty() {
            println!("      {}", worker.description);
        }
        println!("      capabilities: {}", worker.capabilities.join(", "));
        println!(
            "      multi-step planning: {}, approval gates: {}",
            worker.can_multi_step_plan, worker.hitl_enabled
        );
        if !worker.direct_keywords.is_empty() {
            println!("      direct keywords: {}", worker.direct_keywords.join(", "));
        }
    }
    println!();
}
