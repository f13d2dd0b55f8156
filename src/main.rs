//! Overseer - polling task orchestrator with approval gates

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use overseer::config::{StoreConfig, WorkerConfig};
use overseer::events::TracingPublisher;
use overseer::models::{
    run_id_for, ApprovalStatus, NewTask, TaskGuard, TaskPatch, TaskPriority, TaskStatus,
};
use overseer::store::{SqliteTaskRepository, TaskRepository};
use overseer::Worker;

#[derive(Parser)]
#[command(name = "overseer")]
#[command(about = "Polling task orchestrator with approval gates")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    store: StoreConfig,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker loop until interrupted
    Run {
        #[command(flatten)]
        worker: WorkerConfig,
    },

    /// Run a single tick and print its report
    Tick {
        #[command(flatten)]
        worker: WorkerConfig,
    },

    /// Queue a new task
    Enqueue {
        /// Task type, e.g. query or deploy
        #[arg(short = 't', long = "type")]
        task_type: String,

        #[arg(short, long, default_value = "normal")]
        priority: TaskPriority,

        #[arg(long, default_value = "cli")]
        requester: String,

        /// Owning specialty
        #[arg(short, long)]
        specialty: Option<String>,

        /// Requested path (repeatable)
        #[arg(long = "path")]
        paths: Vec<String>,

        /// JSON payload; only its hash is stored
        #[arg(long)]
        payload: Option<String>,
    },

    /// Approve the pending approval for a task
    Approve {
        #[arg(long)]
        task: String,

        /// Approval scope (default: the scope the task waits on)
        #[arg(long)]
        scope: Option<String>,
    },

    /// Reject the pending approval for a task
    Reject {
        #[arg(long)]
        task: String,

        #[arg(long)]
        scope: Option<String>,
    },

    /// Cancel a task
    Cancel {
        #[arg(long)]
        task: String,
    },

    /// Show a task and its run
    Show {
        #[arg(long)]
        task: String,
    },

    /// List tasks
    List {
        #[arg(short, long)]
        status: Option<TaskStatus>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "overseer=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let repo = SqliteTaskRepository::connect(&cli.store).await?;
    repo.migrate().await?;
    let repo: Arc<dyn TaskRepository> = Arc::new(repo);

    match cli.command {
        Commands::Run { worker } => run_worker(repo, worker).await,
        Commands::Tick { worker } => run_tick(repo, worker).await,
        Commands::Enqueue {
            task_type,
            priority,
            requester,
            specialty,
            paths,
            payload,
        } => {
            let mut new_task = NewTask::new(task_type)
                .with_priority(priority)
                .with_requester(requester)
                .with_paths(paths);
            if let Some(specialty) = specialty {
                new_task = new_task.with_specialty(specialty);
            }
            if let Some(raw) = payload {
                let value: serde_json::Value = serde_json::from_str(&raw)?;
                new_task = new_task.with_payload(&value);
            }
            let task = repo.create_task(new_task).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
            Ok(())
        }
        Commands::Approve { task, scope } => {
            resolve(repo.as_ref(), &task, scope, ApprovalStatus::Approved).await
        }
        Commands::Reject { task, scope } => {
            resolve(repo.as_ref(), &task, scope, ApprovalStatus::Rejected).await
        }
        Commands::Cancel { task } => {
            let current = repo
                .get_task(&task)
                .await?
                .ok_or_else(|| anyhow!("task not found: {}", task))?;
            if current.status.is_terminal() {
                bail!("task {} is already {}", task, current.status);
            }
            let patch = TaskPatch::new()
                .status(TaskStatus::Canceled)
                .reason("canceled by operator");
            // The claim stays with any running worker, which releases it
            // at its next step boundary.
            let guard = TaskGuard::new().status(current.status);
            let canceled = repo
                .patch_task_if(&task, &guard, patch)
                .await?
                .ok_or_else(|| anyhow!("task {} changed while canceling, retry", task))?;
            println!("{} -> {}", canceled.id, canceled.status);
            Ok(())
        }
        Commands::Show { task } => {
            let record = repo
                .get_task(&task)
                .await?
                .ok_or_else(|| anyhow!("task not found: {}", task))?;
            let run = repo.get_run(&run_id_for(&task)).await?;
            let steps = match &run {
                Some(run) => repo.list_steps(&run.id).await?,
                None => Vec::new(),
            };
            let view = serde_json::json!({
                "task": record,
                "run": run,
                "steps": steps,
            });
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
        Commands::List { status } => {
            let tasks = repo.list_tasks(status).await?;
            if tasks.is_empty() {
                println!("No tasks.");
            }
            for task in tasks {
                println!(
                    "{}  {:<16}  {:<8}  {:<10}  {}",
                    task.id,
                    task.status.as_str(),
                    task.priority.as_str(),
                    task.task_type,
                    task.reason.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
    }
}

async fn run_worker(repo: Arc<dyn TaskRepository>, config: WorkerConfig) -> Result<()> {
    let worker = Worker::new(config, repo, Arc::new(TracingPublisher))?;
    worker
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await;
    Ok(())
}

async fn run_tick(repo: Arc<dyn TaskRepository>, config: WorkerConfig) -> Result<()> {
    let worker = Worker::new(config, repo, Arc::new(TracingPublisher))?;
    let report = worker.tick().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn resolve(
    repo: &dyn TaskRepository,
    task_id: &str,
    scope: Option<String>,
    decision: ApprovalStatus,
) -> Result<()> {
    let task = repo
        .get_task(task_id)
        .await?
        .ok_or_else(|| anyhow!("task not found: {}", task_id))?;
    let scope = scope.unwrap_or_else(|| task.approval_scope().to_string());
    let approval = repo
        .get_latest_approval_for_task(task_id, &scope)
        .await?
        .ok_or_else(|| anyhow!("no approval requested for {} at scope {}", task_id, scope))?;
    let resolved = repo.resolve_approval(&approval.id, decision).await?;
    println!(
        "{} [{}] -> {}",
        resolved.id,
        resolved.scope,
        resolved.status.as_str()
    );
    Ok(())
}
