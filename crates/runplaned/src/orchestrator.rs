//! Orchestrator — assembles the Runplane subsystems around one store.
//!
//! ```text
//!   AgentRegistry ◄── Dispatcher ◄── DispatchQueue workers
//!        │               │  ▲               ▲
//!        ▼               ▼  │ scale-up      │ trigger
//!   CapacityPool ◄── Autoscaler ────────────┤
//!                                           │
//!                    pending sweep ─────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use runplane_autoscale::Autoscaler;
use runplane_capacity::{CapacityPool, PodBackend};
use runplane_scheduler::{
    DispatchOutcome, DispatchQueue, DispatchResult, Dispatcher, RecoveryReport,
    recover_pending_tasks, run_sweeper,
};
use runplane_state::{Clock, PoolKind, StateResult, StateStore, Task, TaskId};

use crate::agent_registry::AgentRegistry;
use crate::config::RunplaneConfig;
use crate::engine::CommandEngine;

pub struct Orchestrator {
    config: RunplaneConfig,
    store: StateStore,
    clock: Arc<dyn Clock>,
    capacity: Arc<CapacityPool>,
    agents: Arc<AgentRegistry>,
    queue: DispatchQueue,
    dispatcher: Arc<Dispatcher>,
    autoscaler: Arc<Autoscaler>,
}

impl Orchestrator {
    pub fn new(
        config: RunplaneConfig,
        store: StateStore,
        clock: Arc<dyn Clock>,
        backend: Arc<dyn PodBackend>,
    ) -> Self {
        let capacity = Arc::new(
            CapacityPool::new(backend, clock.clone()).with_config(config.capacity.capacity_config()),
        );
        let agents = Arc::new(AgentRegistry::new(capacity.clone()));
        let queue = DispatchQueue::new(clock.clone());
        let engine = Arc::new(CommandEngine::new(
            store.clone(),
            clock.clone(),
            config.local.clone(),
        ));

        let autoscaler = Arc::new(
            Autoscaler::new(store.clone(), capacity.clone(), queue.clone(), clock.clone())
                .with_config(config.autoscale.autoscale_config()),
        );
        let dispatcher = Arc::new(
            Dispatcher::new(
                store.clone(),
                capacity.clone(),
                agents.clone(),
                engine,
                queue.clone(),
                clock.clone(),
            )
            .with_config(config.dispatch.dispatch_config())
            .with_scale_up(autoscaler.scale_up_callback()),
        );

        Self {
            config,
            store,
            clock,
            capacity,
            agents,
            queue,
            dispatcher,
            autoscaler,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    pub fn capacity(&self) -> &Arc<CapacityPool> {
        &self.capacity
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn autoscaler(&self) -> &Arc<Autoscaler> {
        &self.autoscaler
    }

    /// Write the pools and workspaces declared in the config to the store.
    pub fn seed(&self) -> StateResult<()> {
        for pool in &self.config.pools {
            self.store.put_pool(pool)?;
        }
        for workspace in &self.config.workspaces {
            self.store.put_workspace(workspace)?;
        }
        if !self.config.pools.is_empty() || !self.config.workspaces.is_empty() {
            info!(
                pools = self.config.pools.len(),
                workspaces = self.config.workspaces.len(),
                "configured pools and workspaces stored"
            );
        }
        Ok(())
    }

    pub async fn recover(&self) -> StateResult<RecoveryReport> {
        recover_pending_tasks(&self.store, &self.queue, self.clock.as_ref()).await
    }

    /// Give every Kubernetes pool its initial pods.
    pub async fn ensure_pools(&self) -> StateResult<()> {
        for pool in self.store.list_pools()? {
            if pool.kind != PoolKind::Kubernetes {
                continue;
            }
            match self.autoscaler.ensure_pods_for_pool(&pool.pool_id).await {
                Ok((count, _)) => info!(pool_id = %pool.pool_id, pods = count, "pool pods ensured"),
                Err(e) => warn!(pool_id = %pool.pool_id, error = %e, "failed to ensure pool pods"),
            }
        }
        Ok(())
    }

    /// Persist a new Pending task and queue its workspace.
    pub async fn submit(&self, task: Task) -> StateResult<Task> {
        let task = self.store.create_task(task)?;
        info!(task_id = task.id, workspace_id = %task.workspace_id, kind = %task.kind, "task submitted");
        self.queue.trigger(&task.workspace_id).await;
        Ok(task)
    }

    /// Record an operator's confirmation and start the apply phase.
    pub async fn confirm_apply(&self, task_id: TaskId, user: &str) -> DispatchResult<DispatchOutcome> {
        let task = self
            .store
            .confirm_apply(task_id, user, self.clock.now_secs())?;
        self.dispatcher
            .execute_confirmed_apply(&task.workspace_id, task_id)
            .await
    }

    /// Recover, then run the dispatch workers, the pending sweep and the
    /// autoscaler until `shutdown` flips.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.seed()?;
        let report = self.recover().await?;
        info!(
            restored = report.restored.len(),
            failed = report.failed.len(),
            cancelled = report.cancelled.len(),
            apply_pending = report.apply_pending,
            "startup recovery finished"
        );
        self.ensure_pools().await?;

        // ── Start background tasks ─────────────────────────────────

        let queue_handle = {
            let queue = self.queue.clone();
            let dispatcher = self.dispatcher.clone();
            let workers = self.config.dispatch.workers;
            let shutdown = shutdown.clone();
            tokio::spawn(async move { queue.run(dispatcher, workers, shutdown).await })
        };

        let sweep_handle = tokio::spawn(run_sweeper(
            self.store.clone(),
            self.queue.clone(),
            self.clock.clone(),
            Duration::from_secs(self.config.dispatch.sweep_interval_secs),
            shutdown.clone(),
        ));

        let autoscale_handle = {
            let autoscaler = self.autoscaler.clone();
            let interval = Duration::from_secs(self.config.autoscale.interval_secs);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { autoscaler.run(interval, shutdown).await })
        };

        info!(workers = self.config.dispatch.workers, "orchestrator running");

        let _ = queue_handle.await;
        let _ = sweep_handle.await;
        let _ = autoscale_handle.await;

        info!("orchestrator stopped");
        Ok(())
    }
}
