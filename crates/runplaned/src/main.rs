//! runplaned — the Runplane daemon and its maintenance commands.
//!
//! # Usage
//!
//! ```text
//! runplaned --config /etc/runplane/runplane.toml serve
//! runplaned next --workspace ws-1
//! runplaned confirm-apply --task 42 --user alice
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use runplane_capacity::InMemoryPodBackend;
use runplane_scheduler::{cleanup_orphan_tasks, next_executable_task};
use runplane_state::{Clock, StateStore, SystemClock, Task, TaskId, TaskKind};
use runplaned::{Orchestrator, RunplaneConfig};

const DEFAULT_FILTER: &str = "info,runplaned=debug,runplane=debug";

#[derive(Parser)]
#[command(name = "runplaned", about = "Runplane run orchestrator")]
struct Cli {
    /// Path to runplane.toml. Built-in defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// State store path, overriding the config file.
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Plan,
    PlanAndApply,
    DriftCheck,
}

impl From<KindArg> for TaskKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Plan => TaskKind::Plan,
            KindArg::PlanAndApply => TaskKind::PlanAndApply,
            KindArg::DriftCheck => TaskKind::DriftCheck,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator until Ctrl-C.
    Serve {
        /// Dispatch worker count, overriding the config file.
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Resolve Running tasks left behind by a previous process.
    Recover,
    /// Show the task the selector would run next for a workspace.
    Next {
        #[arg(long)]
        workspace: String,
    },
    /// Show the live work routed to a pool.
    Pool {
        #[arg(long)]
        pool: String,
    },
    /// Queue a new task. It is dispatched by the next `serve`.
    Submit {
        #[arg(long)]
        workspace: String,
        #[arg(long, value_enum, default_value = "plan")]
        kind: KindArg,
    },
    /// Confirm the apply phase of an ApplyPending task.
    ConfirmApply {
        #[arg(long)]
        task: TaskId,
        #[arg(long)]
        user: String,
    },
}

fn init_tracing(config: &RunplaneConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.log.filter.as_deref().unwrap_or(DEFAULT_FILTER))
    });
    if config.log.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn open_store(path: &Path) -> anyhow::Result<StateStore> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let store = StateStore::open(path)?;
    info!(path = ?path, "state store opened");
    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => RunplaneConfig::from_file(path)?,
        None => RunplaneConfig::default(),
    };
    if let Some(store) = cli.store {
        config.store.path = store;
    }
    init_tracing(&config);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = open_store(&config.store.path)?;

    match cli.command {
        Command::Serve { workers } => {
            if let Some(workers) = workers {
                config.dispatch.workers = workers;
            }
            serve(config, store, clock).await
        }
        Command::Recover => {
            let (restored, failed) = cleanup_orphan_tasks(&store, clock.now_secs())?;
            println!("restored to apply_pending: {restored:?}");
            println!("failed: {failed:?}");
            Ok(())
        }
        Command::Next { workspace } => {
            match next_executable_task(&store, &workspace)? {
                Some(task) => println!("{}", serde_json::to_string_pretty(&task)?),
                None => println!("no executable task for workspace {workspace}"),
            }
            Ok(())
        }
        Command::Pool { pool } => {
            let summary = store.pool_task_summary(&pool)?;
            println!("pool:                    {pool}");
            println!("running:                 {}", summary.running);
            println!("apply_pending:           {}", summary.apply_pending);
            println!("pending:                 {}", summary.pending);
            println!("unblocked_pending:       {}", summary.unblocked_pending);
            println!("unblocked_pending_apply: {}", summary.unblocked_pending_apply);
            println!("awaiting confirmation:   {:?}", summary.apply_pending_task_ids);
            println!("workspaces with pending: {:?}", summary.pending_workspaces);
            Ok(())
        }
        Command::Submit { workspace, kind } => {
            if store.get_workspace(&workspace)?.is_none() {
                anyhow::bail!("workspace {workspace} not found");
            }
            let task = store.create_task(Task::new(workspace, kind.into(), clock.now_secs()))?;
            println!("task {} queued ({})", task.id, task.kind);
            Ok(())
        }
        Command::ConfirmApply { task, user } => {
            let task = store.confirm_apply(task, &user, clock.now_secs())?;
            println!(
                "task {} confirmed by {user}; the apply starts on the next dispatch",
                task.id
            );
            Ok(())
        }
    }
}

async fn serve(config: RunplaneConfig, store: StateStore, clock: Arc<dyn Clock>) -> anyhow::Result<()> {
    info!("Runplane daemon starting");

    let orchestrator = Arc::new(Orchestrator::new(
        config,
        store,
        clock,
        Arc::new(InMemoryPodBackend::new()),
    ));

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run(shutdown_rx).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    handle.await??;
    info!("Runplane daemon stopped");
    Ok(())
}
