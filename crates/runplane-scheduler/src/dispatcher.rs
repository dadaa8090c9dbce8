//! TryDispatch: move a workspace's next task to wherever it can run.
//!
//! ```text
//!   select ──► lock (PlanAndApply) ──► gate ──► Local:  claim ──► spawn engine
//!                                               Remote: slot ──► agent ──► claim ──► send
//!                                                                   │                 │
//!                                                                   └── retry ◄───────┘
//! ```
//!
//! The task is persisted as Running before it is sent. A failed send rolls
//! the row back, frees the slot and schedules a backoff retry.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};
use std::time::Duration;

use futures_util::FutureExt;
use tracing::{debug, error, info, warn};

use runplane_capacity::{BoxFuture, CapacityPool, SlotAssignment};
use runplane_state::{
    AgentId, Claim, Clock, ExecutionMode, Stage, StateStore, Task, TaskId, TaskKind, TaskStatus,
    Workspace,
};

use crate::backoff::BackoffPolicy;
use crate::collaborators::{
    AgentAction, AgentChannel, CompletionHooks, ExecutionEngine, NoopHooks, ScaleUpCallback,
};
use crate::error::{DispatchError, DispatchResult};
use crate::locks::WorkspaceLocks;
use crate::queue::{DispatchQueue, WorkspaceHandler};
use crate::selector;

/// Dispatcher tunables.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub backoff: BackoffPolicy,
    /// Flat delay when no agent is connected at all.
    pub no_agents_delay: Duration,
    /// Flat delay when a remote workspace has no pool.
    pub no_pool_delay: Duration,
    /// Wall-clock limit for one local execution.
    pub local_timeout: Duration,
    /// Lifetime of the storage lease taken while a task is handed over.
    pub claim_lease: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            no_agents_delay: Duration::from_secs(15),
            no_pool_delay: Duration::from_secs(10),
            local_timeout: Duration::from_secs(60 * 60),
            claim_lease: Duration::from_secs(60),
        }
    }
}

/// Why a dispatch attempt was deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    NoPool,
    NoFreeSlot,
    NoConnectedAgents,
    NoEligibleAgent,
    PersistFailed,
    SendFailed,
}

impl RetryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryReason::NoPool => "no_pool",
            RetryReason::NoFreeSlot => "no_free_slot",
            RetryReason::NoConnectedAgents => "no_connected_agents",
            RetryReason::NoEligibleAgent => "no_eligible_agent",
            RetryReason::PersistFailed => "persist_failed",
            RetryReason::SendFailed => "send_failed",
        }
    }
}

/// Result of one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Nothing in the workspace can run now.
    Idle,
    /// The task moved on while we looked at it.
    Skipped { task_id: TaskId },
    /// Running locally (`agent_id == None`) or sent to an agent.
    Started {
        task_id: TaskId,
        agent_id: Option<AgentId>,
    },
    /// Deferred; the workspace is queued again after `delay`.
    Retry {
        task_id: TaskId,
        delay: Duration,
        reason: RetryReason,
    },
}

#[derive(Debug, Clone, Copy)]
enum Hook {
    RunTriggers,
    DriftResult,
    CmdbSync,
}

impl Hook {
    fn as_str(&self) -> &'static str {
        match self {
            Hook::RunTriggers => "run_triggers",
            Hook::DriftResult => "drift_result",
            Hook::CmdbSync => "cmdb_sync",
        }
    }
}

thread_local! {
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Chain a panic hook that keeps the panicking thread's backtrace for
/// [`take_panic_trace`]. Installed once per process.
fn install_panic_trace_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let trace = Backtrace::force_capture().to_string();
            PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn take_panic_trace() -> Option<String> {
    PANIC_TRACE.with(|slot| slot.borrow_mut().take())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Drives tasks from Pending (or confirmed ApplyPending) to Running.
///
/// Cheap to clone; local executions hold a clone for their lifetime.
#[derive(Clone)]
pub struct Dispatcher {
    store: StateStore,
    capacity: Arc<CapacityPool>,
    agents: Arc<dyn AgentChannel>,
    engine: Arc<dyn ExecutionEngine>,
    hooks: Arc<dyn CompletionHooks>,
    queue: DispatchQueue,
    locks: Arc<WorkspaceLocks>,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
    scale_up: Option<ScaleUpCallback>,
    /// Lease holder name written on claimed rows.
    holder: String,
}

impl Dispatcher {
    pub fn new(
        store: StateStore,
        capacity: Arc<CapacityPool>,
        agents: Arc<dyn AgentChannel>,
        engine: Arc<dyn ExecutionEngine>,
        queue: DispatchQueue,
        clock: Arc<dyn Clock>,
    ) -> Self {
        install_panic_trace_hook();
        Self {
            store,
            capacity,
            agents,
            engine,
            hooks: Arc::new(NoopHooks),
            queue,
            locks: Arc::new(WorkspaceLocks::new()),
            clock,
            config: DispatchConfig::default(),
            scale_up: None,
            holder: format!("runplaned-{}", std::process::id()),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn CompletionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Called when a Kubernetes pool has no connected agents.
    pub fn with_scale_up(mut self, callback: ScaleUpCallback) -> Self {
        self.scale_up = Some(callback);
        self
    }

    pub fn with_locks(mut self, locks: Arc<WorkspaceLocks>) -> Self {
        self.locks = locks;
        self
    }

    /// Name this dispatcher's storage leases. Defaults to the process ID.
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    pub fn capacity(&self) -> &Arc<CapacityPool> {
        &self.capacity
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    // ── Entry points ───────────────────────────────────────────────

    /// Attempt to start the workspace's next executable task.
    ///
    /// A panic inside the attempt is caught, logged and turned into a
    /// retry; it never takes the worker down.
    pub async fn try_dispatch(&self, workspace_id: &str) -> DispatchResult<DispatchOutcome> {
        self.guarded(workspace_id, self.dispatch_next(workspace_id))
            .await
    }

    /// Run the apply phase of a confirmed ApplyPending task.
    pub async fn execute_confirmed_apply(
        &self,
        workspace_id: &str,
        task_id: TaskId,
    ) -> DispatchResult<DispatchOutcome> {
        let task = self
            .store
            .get_task(task_id)?
            .ok_or(DispatchError::TaskNotFound(task_id))?;
        if task.workspace_id != workspace_id {
            return Err(DispatchError::WorkspaceMismatch {
                task_id,
                requested: workspace_id.to_string(),
                actual: task.workspace_id,
            });
        }
        if task.status != TaskStatus::ApplyPending {
            return Err(DispatchError::NotApplyPending {
                task_id,
                status: task.status,
            });
        }
        if !task.is_apply_confirmed() {
            error!(task_id, %workspace_id, "security violation: apply requested without confirmation");
            return Err(DispatchError::UnconfirmedApply { task_id });
        }

        if self.workspace_locked(workspace_id)? {
            info!(task_id, %workspace_id, "workspace locked, confirmed apply waits");
            return Ok(DispatchOutcome::Idle);
        }

        info!(
            task_id,
            %workspace_id,
            confirmed_by = task.apply_confirmed_by.as_deref().unwrap_or_default(),
            "executing confirmed apply"
        );
        let _guard = self.locks.lock(workspace_id).await;
        self.guarded(workspace_id, self.dispatch_task(task)).await
    }

    /// Bookkeeping after a task leaves Running.
    ///
    /// ApplyPending keeps its slot Reserved. Terminal tasks free their slot,
    /// fire completion hooks and re-trigger the workspace.
    pub async fn on_task_completed(&self, task_id: TaskId) -> DispatchResult<()> {
        let task = self
            .store
            .get_task(task_id)?
            .ok_or(DispatchError::TaskNotFound(task_id))?;

        match task.status {
            TaskStatus::ApplyPending => {
                match self.capacity.reserve_task_slot(task_id).await {
                    Ok(true) => {}
                    Ok(false) => debug!(task_id, "apply-pending task holds no slot"),
                    Err(e) => warn!(task_id, error = %e, "failed to reserve slot for apply"),
                }
                info!(task_id, workspace_id = %task.workspace_id, "plan finished, awaiting apply confirmation");
            }
            status if status.is_terminal() => {
                if let Err(e) = self.capacity.release_task_slot(task_id).await {
                    warn!(task_id, error = %e, "failed to release task slot");
                }
                self.fire_hooks(&task);
                info!(task_id, workspace_id = %task.workspace_id, %status, "task finished");
                self.queue.trigger(&task.workspace_id).await;
            }
            status => debug!(task_id, %status, "task not finished; nothing to do"),
        }
        Ok(())
    }

    // ── Selection ──────────────────────────────────────────────────

    async fn guarded<F>(&self, workspace_id: &str, attempt: F) -> DispatchResult<DispatchOutcome>
    where
        F: Future<Output = DispatchResult<DispatchOutcome>>,
    {
        match AssertUnwindSafe(attempt).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                let backtrace =
                    take_panic_trace().unwrap_or_else(|| Backtrace::force_capture().to_string());
                error!(%workspace_id, panic = %message, %backtrace, "dispatch panicked");
                self.queue
                    .schedule(workspace_id, self.config.backoff.delay(0))
                    .await;
                Err(DispatchError::Panicked {
                    workspace_id: workspace_id.to_string(),
                    message,
                })
            }
        }
    }

    /// Administrative hold; nothing in the workspace may start.
    fn workspace_locked(&self, workspace_id: &str) -> DispatchResult<bool> {
        let locked = self
            .store
            .get_workspace(workspace_id)?
            .is_some_and(|ws| ws.is_locked);
        if locked {
            debug!(%workspace_id, "workspace locked");
        }
        Ok(locked)
    }

    /// A confirmed apply whose dispatch was rolled back.
    fn resumable_apply(&self, workspace_id: &str) -> DispatchResult<Option<Task>> {
        let tasks = self.store.list_tasks_for_workspace(workspace_id)?;
        Ok(tasks
            .into_iter()
            .find(|t| t.status == TaskStatus::ApplyPending && t.is_apply_confirmed()))
    }

    async fn dispatch_next(&self, workspace_id: &str) -> DispatchResult<DispatchOutcome> {
        if self.workspace_locked(workspace_id)? {
            return Ok(DispatchOutcome::Idle);
        }
        if let Some(task) = self.resumable_apply(workspace_id)? {
            let _guard = self.locks.lock(workspace_id).await;
            return match self.store.get_task(task.id)? {
                Some(current) if current.status == TaskStatus::ApplyPending => {
                    self.dispatch_task(current).await
                }
                _ => Ok(DispatchOutcome::Skipped { task_id: task.id }),
            };
        }

        let Some(task) = selector::next_executable_task(&self.store, workspace_id)? else {
            debug!(%workspace_id, "no executable task");
            return Ok(DispatchOutcome::Idle);
        };
        if !task.kind.is_exclusive() {
            return self.dispatch_task(task).await;
        }

        let _guard = self.locks.lock(workspace_id).await;
        // Another worker may have started it while we waited; run whatever
        // is next now.
        match selector::next_executable_task(&self.store, workspace_id)? {
            Some(current) => {
                if current.id != task.id {
                    debug!(
                        %workspace_id,
                        task_id = task.id,
                        next = current.id,
                        "selection changed under lock"
                    );
                }
                self.dispatch_task(current).await
            }
            None => {
                debug!(%workspace_id, task_id = task.id, "selection emptied under lock");
                Ok(DispatchOutcome::Idle)
            }
        }
    }

    async fn dispatch_task(&self, task: Task) -> DispatchResult<DispatchOutcome> {
        if task.status == TaskStatus::ApplyPending && !task.is_apply_confirmed() {
            error!(
                task_id = task.id,
                workspace_id = %task.workspace_id,
                "security violation: unconfirmed apply reached dispatch"
            );
            return Err(DispatchError::UnconfirmedApply { task_id: task.id });
        }

        let workspace = self
            .store
            .get_workspace(&task.workspace_id)?
            .ok_or_else(|| DispatchError::WorkspaceNotFound(task.workspace_id.clone()))?;

        match workspace.execution_mode {
            ExecutionMode::Local => Ok(self.start_local(task).await),
            ExecutionMode::Agent | ExecutionMode::Kubernetes => {
                Ok(self.push_to_agent(task, &workspace).await)
            }
        }
    }

    // ── Persistence ────────────────────────────────────────────────

    /// Move the task from its observed status to Running under a storage
    /// lease.
    ///
    /// Returns `None` if the row moved on, is leased elsewhere, its
    /// workspace got locked or an earlier PlanAndApply became active.
    fn claim(&self, task: &Task, agent_id: Option<&str>) -> DispatchResult<Option<Task>> {
        let stage = if task.status == TaskStatus::ApplyPending {
            Stage::Applying
        } else {
            Stage::Planning
        };
        let now = self.clock.now_secs();

        let claim = self.store.claim_task(
            task.id,
            task.status,
            &self.holder,
            self.config.claim_lease.as_secs(),
            now,
            |t| {
                t.stage = Some(stage);
                t.agent_id = agent_id.map(str::to_string);
                t.started_at = Some(now);
            },
        )?;
        match claim {
            Claim::Claimed(claimed) => Ok(Some(claimed)),
            other => {
                debug!(task_id = task.id, claim = ?other, "task not claimed");
                Ok(None)
            }
        }
    }

    /// The task is on its way: clear its retry counter and drop our lease.
    fn settle(&self, task: &Task) {
        let holder = self.holder.as_str();
        if let Err(e) = self.store.update_task(task.id, |t| {
            t.retry_count = 0;
            if t.lease.as_ref().is_some_and(|l| l.holder == holder) {
                t.lease = None;
            }
            Ok(())
        }) {
            warn!(task_id = task.id, error = %e, "failed to settle claimed task");
        }
    }

    /// Undo a claim after the send failed.
    fn roll_back(&self, previous: &Task) {
        let result = self.store.update_task(previous.id, |t| {
            if t.status != TaskStatus::Running {
                return Ok(());
            }
            t.transition_to(previous.status)?;
            t.agent_id = None;
            t.lease = None;
            t.stage = previous.stage;
            t.started_at = previous.started_at;
            Ok(())
        });
        if let Err(e) = result {
            error!(task_id = previous.id, error = %e, "failed to roll back task");
        }
    }

    // ── Retries ────────────────────────────────────────────────────

    async fn retry_flat(&self, task: &Task, delay: Duration, reason: RetryReason) -> DispatchOutcome {
        self.queue.schedule(&task.workspace_id, delay).await;
        info!(
            task_id = task.id,
            workspace_id = %task.workspace_id,
            reason = reason.as_str(),
            delay_secs = delay.as_secs(),
            "dispatch deferred"
        );
        DispatchOutcome::Retry {
            task_id: task.id,
            delay,
            reason,
        }
    }

    /// Bump the task's retry counter and queue it after the backoff delay
    /// for its previous count.
    async fn retry_with_backoff(&self, task: &Task, reason: RetryReason) -> DispatchOutcome {
        let delay = self.config.backoff.delay(task.retry_count);
        let retry_count = match self.store.update_task(task.id, |t| {
            t.retry_count = t.retry_count.saturating_add(1);
            Ok(())
        }) {
            Ok(t) => t.retry_count,
            Err(e) => {
                warn!(task_id = task.id, error = %e, "failed to record retry");
                task.retry_count.saturating_add(1)
            }
        };

        self.queue.schedule(&task.workspace_id, delay).await;
        info!(
            task_id = task.id,
            workspace_id = %task.workspace_id,
            reason = reason.as_str(),
            retry_count,
            delay_secs = delay.as_secs(),
            "dispatch retry scheduled"
        );
        DispatchOutcome::Retry {
            task_id: task.id,
            delay,
            reason,
        }
    }

    // ── Local ──────────────────────────────────────────────────────

    async fn start_local(&self, task: Task) -> DispatchOutcome {
        let task_id = task.id;
        let claimed = match self.claim(&task, None) {
            Ok(Some(claimed)) => claimed,
            Ok(None) => return DispatchOutcome::Skipped { task_id },
            Err(e) => {
                warn!(task_id, error = %e, "failed to persist local start");
                return self.retry_with_backoff(&task, RetryReason::PersistFailed).await;
            }
        };
        self.settle(&claimed);

        info!(
            task_id,
            workspace_id = %claimed.workspace_id,
            kind = %claimed.kind,
            stage = claimed.stage.map(|s| s.as_str()).unwrap_or_default(),
            "local execution started"
        );
        let this = self.clone();
        tokio::spawn(async move { this.run_local(claimed).await });

        DispatchOutcome::Started {
            task_id,
            agent_id: None,
        }
    }

    async fn run_local(&self, task: Task) {
        let task_id = task.id;
        let limit = self.config.local_timeout;
        let applying = task.stage == Some(Stage::Applying);
        let run = async {
            if applying {
                self.engine.execute_apply(&task).await
            } else {
                self.engine.execute_plan(&task).await
            }
        };

        let failure = match tokio::time::timeout(limit, run).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                warn!(task_id, error = %e, "local execution failed");
                Some(e.to_string())
            }
            Err(_) => {
                warn!(task_id, timeout_secs = limit.as_secs(), "local execution timed out");
                Some(format!("execution timed out after {}s", limit.as_secs()))
            }
        };

        if let Err(e) = self.fail_if_still_running(task_id, failure) {
            error!(task_id, error = %e, "failed to finalize local task");
        }
        if let Err(e) = self.on_task_completed(task_id).await {
            warn!(task_id, error = %e, "completion handling failed");
        }
    }

    /// The engine must leave the task terminal or ApplyPending.
    fn fail_if_still_running(&self, task_id: TaskId, failure: Option<String>) -> DispatchResult<()> {
        let current = self
            .store
            .get_task(task_id)?
            .ok_or(DispatchError::TaskNotFound(task_id))?;
        if current.status != TaskStatus::Running {
            return Ok(());
        }

        let now = self.clock.now_secs();
        let message =
            failure.unwrap_or_else(|| "execution ended without a final status".to_string());
        self.store.update_task(task_id, |t| {
            if t.status != TaskStatus::Running {
                return Ok(());
            }
            if t.error_message.is_none() {
                t.error_message = Some(message);
            }
            t.finish(TaskStatus::Failed, now)
        })?;
        warn!(task_id, "task still running after execution, marked failed");
        Ok(())
    }

    // ── Remote ─────────────────────────────────────────────────────

    async fn release(&self, placed: Option<SlotAssignment>) {
        if let Some(p) = placed
            && let Err(e) = self.capacity.release_slot(&p.pod_name, p.slot).await
        {
            warn!(pod_name = %p.pod_name, slot = p.slot, error = %e, "failed to release slot");
        }
    }

    fn request_scale_up(&self, pool_id: &str) {
        let Some(callback) = &self.scale_up else {
            return;
        };
        let pool_id = pool_id.to_string();
        let scaling = callback(pool_id.clone());
        tokio::spawn(async move {
            if let Err(e) = scaling.await {
                warn!(%pool_id, error = %e, "scale-up request failed");
            }
        });
    }

    fn pick_agent_candidates(&self, pool_id: &str, kind: TaskKind) -> Vec<AgentId> {
        self.agents
            .connected_agents()
            .into_iter()
            .filter(|a| a.pool_id.as_deref() == Some(pool_id))
            .filter(|a| self.agents.is_agent_available(&a.agent_id, kind))
            .map(|a| a.agent_id)
            .collect()
    }

    async fn push_to_agent(&self, task: Task, workspace: &Workspace) -> DispatchOutcome {
        let task_id = task.id;
        let Some(pool_id) = workspace.current_pool_id.clone() else {
            warn!(task_id, workspace_id = %workspace.workspace_id, "remote workspace has no agent pool");
            return self
                .retry_flat(&task, self.config.no_pool_delay, RetryReason::NoPool)
                .await;
        };
        let kubernetes = workspace.execution_mode == ExecutionMode::Kubernetes;

        let mut placed = None;
        if kubernetes {
            if task.status == TaskStatus::ApplyPending {
                placed = self.capacity.find_pod_by_task_id(task_id).await.ok();
            }
            if placed.is_none() {
                match self.capacity.allocate_slot(&pool_id, task_id, task.kind).await {
                    Ok(p) => placed = Some(p),
                    Err(e) => {
                        debug!(task_id, %pool_id, error = %e, "no slot available");
                        return self.retry_with_backoff(&task, RetryReason::NoFreeSlot).await;
                    }
                }
            }
        }

        let connected = self.agents.connected_agents();
        if connected.is_empty() {
            self.release(placed).await;
            if kubernetes {
                self.request_scale_up(&pool_id);
            }
            info!(task_id, %pool_id, "no agents connected");
            return self
                .retry_flat(&task, self.config.no_agents_delay, RetryReason::NoConnectedAgents)
                .await;
        }

        // A slot found by the pool names the agent on its pod; use it only
        // while that agent is connected.
        let mut agent_id = placed
            .as_ref()
            .and_then(|p| p.agent_id.clone())
            .filter(|pre| connected.iter().any(|a| &a.agent_id == pre));

        if agent_id.is_none() {
            self.release(placed.take()).await;
            for candidate in self.pick_agent_candidates(&pool_id, task.kind) {
                if !kubernetes {
                    agent_id = Some(candidate);
                    break;
                }
                match self
                    .capacity
                    .allocate_slot_on_agent(&candidate, task_id, task.kind)
                    .await
                {
                    Ok(p) => {
                        placed = Some(p);
                        agent_id = Some(candidate);
                        break;
                    }
                    Err(e) => debug!(task_id, agent_id = %candidate, error = %e, "agent pod has no slot"),
                }
            }
        }

        let Some(agent_id) = agent_id else {
            info!(task_id, %pool_id, "no eligible agent");
            return self.retry_with_backoff(&task, RetryReason::NoEligibleAgent).await;
        };

        let claimed = match self.claim(&task, Some(&agent_id)) {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                self.release(placed).await;
                return DispatchOutcome::Skipped { task_id };
            }
            Err(e) => {
                warn!(task_id, error = %e, "failed to persist dispatch");
                self.release(placed).await;
                return self.retry_with_backoff(&task, RetryReason::PersistFailed).await;
            }
        };

        let action = if task.status == TaskStatus::ApplyPending {
            AgentAction::Apply
        } else {
            AgentAction::Plan
        };
        match self
            .agents
            .send_task(&agent_id, task_id, &task.workspace_id, action)
            .await
        {
            Ok(()) => {
                if let Some(p) = &placed
                    && let Err(e) = self.capacity.mark_slot_running(&p.pod_name, p.slot).await
                {
                    warn!(task_id, pod_name = %p.pod_name, error = %e, "failed to mark slot running");
                }
                self.settle(&claimed);
                info!(
                    task_id,
                    workspace_id = %task.workspace_id,
                    %agent_id,
                    %action,
                    "task sent to agent"
                );
                DispatchOutcome::Started {
                    task_id,
                    agent_id: Some(agent_id),
                }
            }
            Err(e) => {
                warn!(task_id, %agent_id, error = %e, "send to agent failed");
                self.release(placed).await;
                self.roll_back(&task);
                self.retry_with_backoff(&task, RetryReason::SendFailed).await
            }
        }
    }

    // ── Hooks ──────────────────────────────────────────────────────

    fn fire_hooks(&self, task: &Task) {
        if task.status == TaskStatus::Applied {
            self.spawn_hook(Hook::RunTriggers, task);
        }
        if task.kind == TaskKind::DriftCheck {
            self.spawn_hook(Hook::DriftResult, task);
        }
        if task.kind == TaskKind::PlanAndApply
            && matches!(task.status, TaskStatus::Applied | TaskStatus::Failed)
        {
            self.spawn_hook(Hook::CmdbSync, task);
        }
    }

    fn spawn_hook(&self, hook: Hook, task: &Task) {
        let hooks = self.hooks.clone();
        let task = task.clone();
        tokio::spawn(async move {
            let result = match hook {
                Hook::RunTriggers => hooks.run_triggers(&task).await,
                Hook::DriftResult => hooks.drift_result(&task).await,
                Hook::CmdbSync => hooks.cmdb_sync(&task).await,
            };
            if let Err(e) = result {
                warn!(task_id = task.id, hook = hook.as_str(), error = %e, "completion hook failed");
            }
        });
    }
}

impl WorkspaceHandler for Dispatcher {
    fn handle<'a>(&'a self, workspace_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            match self.try_dispatch(workspace_id).await {
                Ok(outcome) => debug!(%workspace_id, ?outcome, "dispatch attempt finished"),
                Err(e) => warn!(%workspace_id, error = %e, "dispatch attempt failed"),
            }
        })
    }
}
