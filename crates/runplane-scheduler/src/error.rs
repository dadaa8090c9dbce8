//! Error types for the Runplane scheduler.

use thiserror::Error;

use runplane_capacity::CapacityError;
use runplane_state::{StateError, TaskId, TaskStatus};

/// Result type alias for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors returned by dispatch entry points.
///
/// Transient conditions (no agents, no capacity, send failures) are not
/// errors: they surface as a scheduled retry in the dispatch outcome.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// An ApplyPending task reached dispatch without operator confirmation.
    #[error("task {task_id}: apply requires explicit confirmation")]
    UnconfirmedApply { task_id: TaskId },

    #[error("task {task_id} is not awaiting apply (current: {status})")]
    NotApplyPending { task_id: TaskId, status: TaskStatus },

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("workspace {0} not found")]
    WorkspaceNotFound(String),

    #[error("task {task_id} belongs to workspace {actual}, not {requested}")]
    WorkspaceMismatch {
        task_id: TaskId,
        requested: String,
        actual: String,
    },

    #[error("dispatch for workspace {workspace_id} panicked: {message}")]
    Panicked {
        workspace_id: String,
        message: String,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Capacity(#[from] CapacityError),
}
