//! # TaskLane: tenant-scoped task orchestration
//!
//! Usage:
//!   tasklane serve                          # Workers + sweeper until Ctrl-C
//!   tasklane submit "write a post" -p urgent
//!   tasklane list --status failed
//!   tasklane status <task-id>
//!   tasklane cancel <task-id> | retry <task-id>
//!   tasklane sweep                          # One administrative sweep

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use tasklane_core::config::StoreBackend;
use tasklane_core::traits::TaskStore;
use tasklane_core::{
    HandlerOutcome, Lane, Page, Priority, Task, TaskFilter, TaskLaneConfig, TaskStatus,
};
use tasklane_scheduler::{
    ControlPlane, Engine, ExecutionContext, InMemoryLaneBroker, InMemoryTaskStore, Notifier,
    NotifySink, ProcessorRegistry, SqliteTaskStore, SubmitRequest, TaskHandler, TaskPatch,
    WebhookSink, WorkerPool,
};

#[derive(Parser)]
#[command(
    name = "tasklane",
    version,
    about = "📋 TaskLane: priority lanes, scheduled sweeps, retry and cancellation"
)]
struct Cli {
    /// Config file (default: ~/.tasklane/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run workers and the periodic sweeper until Ctrl-C
    Serve,
    /// Submit a task
    Submit {
        description: String,
        #[arg(short, long, default_value = "normal")]
        priority: Priority,
        #[arg(short, long)]
        tenant: Option<String>,
        /// Earliest dispatch time (RFC 3339)
        #[arg(long)]
        at: Option<DateTime<Utc>>,
        /// `hourly`, `daily`, `weekly`, `@every 15m` or a 5-field cron expression
        #[arg(long)]
        every: Option<String>,
        /// JSON object stored as task metadata
        #[arg(long)]
        metadata: Option<String>,
    },
    /// List a tenant's tasks, newest first
    List {
        #[arg(short, long)]
        tenant: Option<String>,
        #[arg(short, long)]
        status: Vec<TaskStatus>,
        #[arg(long, default_value = "20")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// Show a task's status snapshot
    Status { task_id: String },
    /// Change a task's priority
    UpdatePriority { task_id: String, priority: Priority },
    /// Cancel a live task
    Cancel { task_id: String },
    /// Retry a failed task
    Retry { task_id: String },
    /// Dispatch everything due now
    Sweep,
    /// Show lane sizing and queued work per lane
    Lanes,
}

/// Default processor of the binary: reports progress and echoes the description.
struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    fn name(&self) -> &str {
        "echo"
    }

    async fn handle(&self, ctx: &ExecutionContext, task: &Task) -> tasklane_core::Result<HandlerOutcome> {
        ctx.update_progress(50, Some("echoing")).await?;
        if ctx.is_cancelled().await {
            return Ok(HandlerOutcome::failure("cancelled"));
        }
        ctx.set_output("text", json!(task.description), vec![]).await?;
        Ok(HandlerOutcome::success(json!({ "echo": task.description })))
    }
}

fn load_config(path: Option<&str>) -> Result<TaskLaneConfig> {
    let config = match path {
        Some(p) => TaskLaneConfig::load_from(&PathBuf::from(shellexpand::tilde(p).to_string()))?,
        None => TaskLaneConfig::load()?,
    };
    Ok(config)
}

fn open_store(config: &TaskLaneConfig) -> Result<Arc<dyn TaskStore>> {
    Ok(match config.store.backend {
        StoreBackend::Sqlite => Arc::new(SqliteTaskStore::open(&config.store.resolved_path())?),
        StoreBackend::Memory => {
            tracing::warn!("⚠️ Memory store: tasks are lost when the process exits");
            Arc::new(InMemoryTaskStore::new())
        }
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "tasklane=debug,tasklane_scheduler=debug"
    } else {
        "tasklane=info,tasklane_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_deref())?;
    let store = open_store(&config)?;
    let broker = Arc::new(InMemoryLaneBroker::from_config(&config.lanes));

    let mut registry = ProcessorRegistry::new();
    registry.set_default_handler(EchoHandler);

    let webhook_url = config.notify.webhook_url.clone();
    let (notifier, outbox) = Notifier::with_outbox(&config.notify);
    let engine = Arc::new(
        Engine::new(config.clone(), store, broker.clone(), Arc::new(registry))
            .with_notifier(Arc::new(notifier)),
    );
    let mut sinks: Vec<Arc<dyn NotifySink>> = Vec::new();
    if let Some(url) = webhook_url {
        tracing::info!("🔔 Webhook delivery to {url}");
        sinks.push(Arc::new(WebhookSink::new(url)));
    }
    let delivery = tokio::spawn(outbox.drain(sinks));

    let cp = ControlPlane::new(engine.clone());
    let tenant_of = |t: Option<String>| t.unwrap_or_else(|| config.default_tenant.clone());

    match cli.command {
        Command::Serve => {
            println!("📋 TaskLane v{}", env!("CARGO_PKG_VERSION"));
            println!("   🗄️  Store:   {:?} {}", config.store.backend, config.store.path);
            for lane in Lane::ALL {
                println!("   🛤️  Lane {:<10} {} worker(s)", lane.as_str(), config.lanes.workers_for(lane));
            }
            println!();

            engine.recover_queued().await?;
            let shutdown = CancellationToken::new();
            let pool = WorkerPool::start_with(engine.clone(), shutdown.clone());
            let sweeper = engine.spawn_sweeper(shutdown.clone());

            tokio::signal::ctrl_c().await?;
            tracing::info!("🛑 Shutting down");
            shutdown.cancel();
            pool.shutdown().await;
            if let Err(e) = sweeper.await {
                tracing::error!("Sweeper ended abnormally: {e}");
            }
            for stats in broker.stats().await {
                tracing::info!(
                    "🛤️ Lane[{}] processed {} of {} enqueued",
                    stats.lane,
                    stats.total_processed,
                    stats.total_enqueued
                );
            }
        }
        Command::Submit { description, priority, tenant, at, every, metadata } => {
            let metadata = metadata.map(|m| serde_json::from_str(&m)).transpose()?;
            let task = cp
                .submit(SubmitRequest {
                    tenant_id: tenant,
                    scheduled_for: at,
                    recurring_pattern: every,
                    metadata,
                    ..SubmitRequest::new(description, priority)
                })
                .await?;
            println!("✅ {} {} ({})", task.id, task.status, task.priority);
        }
        Command::List { tenant, status, limit, offset } => {
            let filter = TaskFilter {
                statuses: status,
                ..Default::default()
            };
            let tasks = cp.list(&tenant_of(tenant), filter, Page::new(offset, limit)).await?;
            for task in &tasks {
                println!(
                    "{}  {:<11} {:<6} {:>3}%  {}",
                    task.id,
                    task.status.as_str(),
                    task.priority.as_str(),
                    task.progress,
                    task.description
                );
            }
            if tasks.is_empty() {
                println!("(no tasks)");
            }
        }
        Command::Status { task_id } => print_json(&cp.get_status(&task_id).await?)?,
        Command::UpdatePriority { task_id, priority } => {
            let task = cp
                .update(
                    &task_id,
                    TaskPatch {
                        priority: Some(priority),
                        ..Default::default()
                    },
                )
                .await?;
            println!("✏️ {} is now {}", task.id, task.priority);
        }
        Command::Cancel { task_id } => {
            if cp.cancel(&task_id).await? {
                println!("🛑 Cancelled {task_id}");
            } else {
                println!("⏭️ {task_id} already finished");
            }
        }
        Command::Retry { task_id } => {
            let task = cp.retry(&task_id).await?;
            println!("🔄 {} retry #{} → {}", task.id, task.retry_count, task.status);
        }
        Command::Sweep => {
            let dispatched = cp.run_sweep(Utc::now()).await?;
            println!("🧹 Dispatched {dispatched} task(s)");
        }
        Command::Lanes => {
            let queued = engine.store().find_by_status(TaskStatus::Queued).await?;
            for lane in Lane::ALL {
                let waiting = queued
                    .iter()
                    .filter(|t| Lane::for_priority(t.priority) == lane)
                    .count();
                println!(
                    "🛤️  {:<10} workers: {:<3} queued: {}",
                    lane.as_str(),
                    config.lanes.workers_for(lane),
                    waiting
                );
            }
        }
    }

    // Dropping the engine closes the outbox so pending deliveries flush.
    drop(cp);
    drop(engine);
    if let Err(e) = delivery.await {
        tracing::error!("Notify delivery ended abnormally: {e}");
    }
    Ok(())
}
