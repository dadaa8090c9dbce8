//! Picks the next dispatchable task for a workspace.

use runplane_state::{StateResult, StateStore, Task, TaskKind};
use tracing::debug;

/// Policy, in order:
///
/// 1. A locked workspace yields nothing.
/// 2. The oldest Pending PlanAndApply, unless an earlier PlanAndApply of the
///    workspace is still Pending, Running or ApplyPending.
/// 3. The oldest Pending Plan.
/// 4. The oldest Pending DriftCheck.
///
/// ApplyPending tasks are never returned; they only run through the
/// explicit confirmation path.
pub fn next_executable_task(store: &StateStore, workspace_id: &str) -> StateResult<Option<Task>> {
    let Some(workspace) = store.get_workspace(workspace_id)? else {
        debug!(%workspace_id, "workspace not found");
        return Ok(None);
    };
    if workspace.is_locked {
        debug!(%workspace_id, locked_by = ?workspace.locked_by, "workspace locked");
        return Ok(None);
    }

    if let Some(task) = store.oldest_pending(workspace_id, TaskKind::PlanAndApply)? {
        if store.has_blocking_plan_and_apply(workspace_id, task.id)? {
            debug!(%workspace_id, task_id = task.id, "plan_and_apply blocked by earlier task");
        } else {
            return Ok(Some(task));
        }
    }

    if let Some(task) = store.oldest_pending(workspace_id, TaskKind::Plan)? {
        return Ok(Some(task));
    }

    store.oldest_pending(workspace_id, TaskKind::DriftCheck)
}
