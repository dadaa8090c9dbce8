//! Domain types for the Runplane state store.
//!
//! These types represent the persisted state of tasks, workspaces and agent
//! pools. All types are serializable to/from JSON for storage in redb tables.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Numeric task identifier, allocated in ascending order.
pub type TaskId = u64;

/// Unique identifier for a workspace.
pub type WorkspaceId = String;

/// Unique identifier for an agent pool.
pub type PoolId = String;

/// Identity of a connected execution agent.
pub type AgentId = String;

/// Zero-padded table key for a task. Lexical key order equals ID order.
pub fn task_key(id: TaskId) -> String {
    format!("{id:020}")
}

// ── Task ───────────────────────────────────────────────────────────

/// What a task does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Plan,
    PlanAndApply,
    DriftCheck,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Plan => "plan",
            TaskKind::PlanAndApply => "plan_and_apply",
            TaskKind::DriftCheck => "drift_check",
        }
    }

    /// Mutating kinds are serialized per workspace.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, TaskKind::PlanAndApply)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle status.
///
/// Transitions are validated centrally by [`TaskStatus::can_transition_to`]:
///
/// ```text
/// Pending ──► Running ──► Success | Applied | PlannedAndFinished | Failed | Cancelled
///    │           │  ▲
///    │           ▼  │
///    └──────► ApplyPending ──► Cancelled | Failed
///
/// Running ──► Pending        (dispatch rollback)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    ApplyPending,
    Success,
    Applied,
    PlannedAndFinished,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::ApplyPending => "apply_pending",
            TaskStatus::Success => "success",
            TaskStatus::Applied => "applied",
            TaskStatus::PlannedAndFinished => "planned_and_finished",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success
                | TaskStatus::Applied
                | TaskStatus::PlannedAndFinished
                | TaskStatus::Failed
                | TaskStatus::Cancelled
        )
    }

    /// Pending, Running or ApplyPending: the task still owns its place in
    /// the workspace queue.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether the state machine permits `self -> next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Running | ApplyPending | Cancelled | Failed) => true,
            (
                Running,
                Pending | ApplyPending | Success | Applied | PlannedAndFinished | Failed | Cancelled,
            ) => true,
            (ApplyPending, Running | Cancelled | Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fine-grained execution stage recorded alongside `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planning,
    ApplyPending,
    Applying,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Planning => "planning",
            Stage::ApplyPending => "apply_pending",
            Stage::Applying => "applying",
        }
    }
}

/// Who created the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOrigin {
    #[default]
    Manual,
    /// Created by another workspace's run trigger; not safe to replay
    /// after a restart.
    RunTrigger,
    Schedule,
}

/// Storage-level claim on a task row held by one orchestrator process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLease {
    pub holder: String,
    pub locked_at: u64,
    pub expires_at: u64,
}

/// A unit of work against one workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub workspace_id: WorkspaceId,
    pub kind: TaskKind,
    pub status: TaskStatus,
    #[serde(default)]
    pub stage: Option<Stage>,
    /// Executor the task was handed to.
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    #[serde(default)]
    pub retry_count: u32,
    /// Set only by [`crate::StateStore::confirm_apply`].
    #[serde(default)]
    pub apply_confirmed_by: Option<String>,
    #[serde(default)]
    pub apply_confirmed_at: Option<u64>,
    #[serde(default)]
    pub origin: TaskOrigin,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Unix timestamp (seconds).
    pub created_at: u64,
    #[serde(default)]
    pub started_at: Option<u64>,
    #[serde(default)]
    pub completed_at: Option<u64>,
    #[serde(default)]
    pub lease: Option<TaskLease>,
}

impl Task {
    /// A fresh Pending task. The ID is assigned by `StateStore::create_task`.
    pub fn new(workspace_id: impl Into<WorkspaceId>, kind: TaskKind, created_at: u64) -> Self {
        Self {
            id: 0,
            workspace_id: workspace_id.into(),
            kind,
            status: TaskStatus::Pending,
            stage: None,
            agent_id: None,
            retry_count: 0,
            apply_confirmed_by: None,
            apply_confirmed_at: None,
            origin: TaskOrigin::Manual,
            error_message: None,
            created_at,
            started_at: None,
            completed_at: None,
            lease: None,
        }
    }

    pub fn with_origin(mut self, origin: TaskOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn table_key(&self) -> String {
        task_key(self.id)
    }

    /// Whether an operator has confirmed the apply phase.
    pub fn is_apply_confirmed(&self) -> bool {
        self.apply_confirmed_by
            .as_deref()
            .is_some_and(|user| !user.is_empty())
    }

    /// Move to `next`, rejecting transitions the state machine forbids.
    pub fn transition_to(&mut self, next: TaskStatus) -> StateResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(StateError::InvalidTransition {
                task_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Move to a terminal status and stamp the completion time.
    pub fn finish(&mut self, status: TaskStatus, now: u64) -> StateResult<()> {
        debug_assert!(status.is_terminal());
        self.transition_to(status)?;
        self.completed_at = Some(now);
        self.lease = None;
        Ok(())
    }
}

// ── Workspace ──────────────────────────────────────────────────────

/// Where a workspace's tasks execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Local,
    Agent,
    #[serde(rename = "k8s")]
    Kubernetes,
}

impl ExecutionMode {
    pub fn is_remote(&self) -> bool {
        !matches!(self, ExecutionMode::Local)
    }
}

/// Scheduling domain and mutual-exclusion boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub workspace_id: WorkspaceId,
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub current_pool_id: Option<PoolId>,
    /// Administrative hold: blocks every task.
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default)]
    pub locked_by: Option<String>,
}

impl Workspace {
    pub fn new(workspace_id: impl Into<WorkspaceId>, execution_mode: ExecutionMode) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            execution_mode,
            current_pool_id: None,
            is_locked: false,
            locked_by: None,
        }
    }

    pub fn with_pool(mut self, pool_id: impl Into<PoolId>) -> Self {
        self.current_pool_id = Some(pool_id.into());
        self
    }
}

// ── Agent pool ─────────────────────────────────────────────────────

/// Default number of task slots exposed by one pod.
pub const DEFAULT_SLOTS_PER_POD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// Externally managed agents; never autoscaled.
    Static,
    #[serde(rename = "k8s")]
    Kubernetes,
}

/// A recurring window during which new work is suppressed.
///
/// `weekdays` uses ISO numbering (1 = Monday .. 7 = Sunday). Times are
/// `HH:MM`; a window whose `to_time` is earlier than `from_time` crosses
/// midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezeSchedule {
    pub weekdays: Vec<u8>,
    pub from_time: String,
    pub to_time: String,
}

/// An elastic group of pods serving one or more workspaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPool {
    pub pool_id: PoolId,
    pub kind: PoolKind,
    pub min_replicas: u32,
    pub max_replicas: u32,
    #[serde(default = "default_slots_per_pod")]
    pub slots_per_pod: u32,
    #[serde(default)]
    pub freeze_schedules: Vec<FreezeSchedule>,
    /// Unix timestamp (seconds) until which freeze windows are ignored.
    #[serde(default)]
    pub one_time_unfreeze_until: Option<u64>,
}

fn default_slots_per_pod() -> u32 {
    DEFAULT_SLOTS_PER_POD
}

impl AgentPool {
    pub fn kubernetes(pool_id: impl Into<PoolId>, min_replicas: u32, max_replicas: u32) -> Self {
        Self {
            pool_id: pool_id.into(),
            kind: PoolKind::Kubernetes,
            min_replicas,
            max_replicas,
            slots_per_pod: DEFAULT_SLOTS_PER_POD,
            freeze_schedules: Vec::new(),
            one_time_unfreeze_until: None,
        }
    }
}

// ── Pool task summary ──────────────────────────────────────────────

/// Counts of live work routed to one pool, as seen by the autoscaler.
///
/// Only workspaces in Kubernetes mode whose `current_pool_id` is the pool
/// are counted. A pending task is "unblocked" when no earlier task of the
/// same workspace is still active.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolTaskSummary {
    pub running: u32,
    pub apply_pending: u32,
    pub pending: u32,
    pub unblocked_pending: u32,
    pub unblocked_pending_apply: u32,
    pub apply_pending_task_ids: Vec<TaskId>,
    pub pending_workspaces: Vec<WorkspaceId>,
}

impl PoolTaskSummary {
    /// Running or awaiting confirmation: work a pod restart could destroy.
    pub fn in_flight(&self) -> u32 {
        self.running + self.apply_pending
    }
}
