//! Interfaces the dispatcher drives but does not implement.

use std::fmt;
use std::sync::Arc;

use runplane_capacity::BoxFuture;
use runplane_state::{AgentId, PoolId, Task, TaskId, TaskKind};
use tracing::debug;

/// An agent currently holding an open control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedAgent {
    pub agent_id: AgentId,
    pub pool_id: Option<PoolId>,
}

/// What the agent is told to do with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentAction {
    Plan,
    Apply,
}

impl AgentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentAction::Plan => "plan",
            AgentAction::Apply => "apply",
        }
    }
}

impl fmt::Display for AgentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control channel to remote agents.
pub trait AgentChannel: Send + Sync {
    fn connected_agents(&self) -> Vec<ConnectedAgent>;

    /// Whether the agent can take one more task of `kind` right now.
    fn is_agent_available(&self, agent_id: &str, kind: TaskKind) -> bool;

    fn send_task<'a>(
        &'a self,
        agent_id: &'a str,
        task_id: TaskId,
        workspace_id: &'a str,
        action: AgentAction,
    ) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// In-process executor for Local workspaces.
///
/// Implementations update the task record themselves and must leave it
/// terminal or ApplyPending when they return.
pub trait ExecutionEngine: Send + Sync {
    fn execute_plan<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, anyhow::Result<()>>;
    fn execute_apply<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Fire-and-forget follow-ups for finished tasks.
pub trait CompletionHooks: Send + Sync {
    /// A task reached Applied.
    fn run_triggers<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, anyhow::Result<()>>;
    /// A DriftCheck task finished.
    fn drift_result<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, anyhow::Result<()>>;
    /// A PlanAndApply task reached Applied or Failed.
    fn cmdb_sync<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Hooks that only log.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl CompletionHooks for NoopHooks {
    fn run_triggers<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            debug!(task_id = task.id, "run triggers skipped");
            Ok(())
        })
    }

    fn drift_result<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            debug!(task_id = task.id, "drift result skipped");
            Ok(())
        })
    }

    fn cmdb_sync<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            debug!(task_id = task.id, "cmdb sync skipped");
            Ok(())
        })
    }
}

/// Callback asking the autoscaler to provision capacity for a pool.
pub type ScaleUpCallback = Arc<dyn Fn(PoolId) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
