//! Startup recovery and the periodic pending-task sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use runplane_state::{
    Clock, Stage, StateResult, StateStore, TaskId, TaskOrigin, TaskStatus, WorkspaceId,
};

use crate::queue::DispatchQueue;

const INTERRUPTED: &str = "Task interrupted by server restart";
const RUN_TRIGGER_CANCELLED: &str =
    "Cancelled on server restart: run-trigger tasks are not recovered";

/// What startup recovery did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Running rows that were parked awaiting apply, put back to ApplyPending.
    pub restored: Vec<TaskId>,
    /// Running rows nobody owns any more.
    pub failed: Vec<TaskId>,
    pub cancelled: Vec<TaskId>,
    pub apply_pending: usize,
    pub triggered: Vec<WorkspaceId>,
}

/// Resolve Running tasks left behind by a previous process.
///
/// Rows with an unexpired lease belong to an external executor and are
/// left alone. Returns `(restored, failed)`.
pub fn cleanup_orphan_tasks(
    store: &StateStore,
    now: u64,
) -> StateResult<(Vec<TaskId>, Vec<TaskId>)> {
    let mut restored = Vec::new();
    let mut failed = Vec::new();

    for task in store.list_tasks_by_status(TaskStatus::Running)? {
        if task.lease.as_ref().is_some_and(|l| l.expires_at > now) {
            debug!(task_id = task.id, "running task is leased, skipping");
            continue;
        }
        if task.stage == Some(Stage::ApplyPending) {
            store.update_task(task.id, |t| {
                t.transition_to(TaskStatus::ApplyPending)?;
                t.agent_id = None;
                t.lease = None;
                Ok(())
            })?;
            restored.push(task.id);
        } else {
            store.update_task(task.id, |t| {
                t.error_message = Some(INTERRUPTED.to_string());
                t.finish(TaskStatus::Failed, now)
            })?;
            failed.push(task.id);
        }
    }

    if !restored.is_empty() || !failed.is_empty() {
        warn!(
            restored = restored.len(),
            failed = failed.len(),
            "orphaned running tasks cleaned up"
        );
    }
    Ok((restored, failed))
}

/// Cancel Pending tasks created by run triggers.
pub fn cancel_run_trigger_tasks(store: &StateStore, now: u64) -> StateResult<Vec<TaskId>> {
    let mut cancelled = Vec::new();
    for task in store.list_tasks_by_status(TaskStatus::Pending)? {
        if task.origin != TaskOrigin::RunTrigger {
            continue;
        }
        store.update_task(task.id, |t| {
            t.error_message = Some(RUN_TRIGGER_CANCELLED.to_string());
            t.finish(TaskStatus::Cancelled, now)
        })?;
        cancelled.push(task.id);
    }
    if !cancelled.is_empty() {
        info!(count = cancelled.len(), "run-trigger tasks cancelled on restart");
    }
    Ok(cancelled)
}

/// Bring persisted state back to a dispatchable shape after a restart and
/// queue every workspace that still has work, including confirmed applies.
pub async fn recover_pending_tasks(
    store: &StateStore,
    queue: &DispatchQueue,
    clock: &dyn Clock,
) -> StateResult<RecoveryReport> {
    let now = clock.now_secs();
    let (restored, failed) = cleanup_orphan_tasks(store, now)?;
    let cancelled = cancel_run_trigger_tasks(store, now)?;

    let mut triggered = store.workspaces_with_pending()?;
    let parked = store.list_tasks_by_status(TaskStatus::ApplyPending)?;
    // Confirmed while nothing was running: the apply still has to start.
    for task in parked.iter().filter(|t| t.is_apply_confirmed()) {
        if !triggered.contains(&task.workspace_id) {
            triggered.push(task.workspace_id.clone());
        }
    }
    for workspace_id in &triggered {
        queue.trigger(workspace_id).await;
    }

    let apply_pending = parked.len();
    if apply_pending > 0 {
        info!(apply_pending, "tasks awaiting apply confirmation");
    }
    info!(workspaces = triggered.len(), "startup recovery complete");

    Ok(RecoveryReport {
        restored,
        failed,
        cancelled,
        apply_pending,
        triggered,
    })
}

/// Reclaim expired leases and queue every workspace with Pending work or a
/// reclaimed apply.
pub async fn sweep_pending(store: &StateStore, queue: &DispatchQueue, now: u64) -> StateResult<usize> {
    let reclaimed = store.clean_expired_leases(now)?;
    let mut workspaces = store.workspaces_with_pending()?;
    for id in reclaimed {
        if let Some(task) = store.get_task(id)?
            && task.status == TaskStatus::ApplyPending
            && !workspaces.contains(&task.workspace_id)
        {
            workspaces.push(task.workspace_id);
        }
    }
    for workspace_id in &workspaces {
        queue.trigger(workspace_id).await;
    }
    if !workspaces.is_empty() {
        debug!(count = workspaces.len(), "pending sweep queued workspaces");
    }
    Ok(workspaces.len())
}

/// Run [`sweep_pending`] every `interval` until shutdown.
pub async fn run_sweeper(
    store: StateStore,
    queue: DispatchQueue,
    clock: Arc<dyn Clock>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "pending sweep started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = sweep_pending(&store, &queue, clock.now_secs()).await {
                    warn!(error = %e, "pending sweep failed");
                }
            }
            _ = shutdown.changed() => {
                info!("pending sweep shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runplane_state::{
        Claim, ExecutionMode, ManualClock, Task, TaskKind, TaskLease, Workspace,
    };

    fn setup() -> (StateStore, DispatchQueue, Arc<ManualClock>) {
        let store = StateStore::open_in_memory().unwrap();
        for ws in ["ws-1", "ws-2"] {
            store
                .put_workspace(&Workspace::new(ws, ExecutionMode::Agent).with_pool("pool-a"))
                .unwrap();
        }
        let clock = Arc::new(ManualClock::new(5_000));
        let queue = DispatchQueue::new(clock.clone());
        (store, queue, clock)
    }

    fn running(store: &StateStore, ws: &str, stage: Stage) -> Task {
        let task = store
            .create_task(Task::new(ws, TaskKind::PlanAndApply, 1_000))
            .unwrap();
        store
            .update_task(task.id, |t| {
                t.transition_to(TaskStatus::Running)?;
                t.stage = Some(stage);
                t.agent_id = Some("agent-1".into());
                Ok(())
            })
            .unwrap()
    }

    #[test]
    fn orphans_are_failed_or_restored() {
        let (store, _queue, _clock) = setup();
        let planning = running(&store, "ws-1", Stage::Planning);
        let parked = running(&store, "ws-1", Stage::ApplyPending);

        let (restored, failed) = cleanup_orphan_tasks(&store, 6_000).unwrap();
        assert_eq!(restored, vec![parked.id]);
        assert_eq!(failed, vec![planning.id]);

        let planning = store.get_task(planning.id).unwrap().unwrap();
        assert_eq!(planning.status, TaskStatus::Failed);
        assert_eq!(planning.error_message.as_deref(), Some(INTERRUPTED));
        assert_eq!(planning.completed_at, Some(6_000));

        let parked = store.get_task(parked.id).unwrap().unwrap();
        assert_eq!(parked.status, TaskStatus::ApplyPending);
        assert_eq!(parked.agent_id, None);
    }

    #[test]
    fn leased_running_tasks_survive_cleanup() {
        let (store, _queue, _clock) = setup();
        let task = running(&store, "ws-1", Stage::Planning);
        store
            .update_task(task.id, |t| {
                t.lease = Some(TaskLease {
                    holder: "worker-a".into(),
                    locked_at: 5_000,
                    expires_at: 9_000,
                });
                Ok(())
            })
            .unwrap();

        let (restored, failed) = cleanup_orphan_tasks(&store, 6_000).unwrap();
        assert!(restored.is_empty() && failed.is_empty());
        assert_eq!(
            store.get_task(task.id).unwrap().unwrap().status,
            TaskStatus::Running
        );
    }

    #[tokio::test]
    async fn recovery_cancels_run_triggers_and_queues_pending() {
        let (store, queue, clock) = setup();
        running(&store, "ws-1", Stage::Planning);
        let manual = store
            .create_task(Task::new("ws-1", TaskKind::Plan, 1_000))
            .unwrap();
        let triggered = store
            .create_task(
                Task::new("ws-2", TaskKind::Plan, 1_000).with_origin(TaskOrigin::RunTrigger),
            )
            .unwrap();

        let report = recover_pending_tasks(&store, &queue, clock.as_ref())
            .await
            .unwrap();

        assert_eq!(report.cancelled, vec![triggered.id]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.triggered, vec!["ws-1".to_string()]);

        let cancelled = store.get_task(triggered.id).unwrap().unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert_eq!(cancelled.error_message.as_deref(), Some(RUN_TRIGGER_CANCELLED));
        assert_eq!(
            store.get_task(manual.id).unwrap().unwrap().status,
            TaskStatus::Pending
        );
        assert_eq!(queue.take_due().await, vec!["ws-1".to_string()]);
    }

    #[tokio::test]
    async fn recovery_queues_confirmed_applies() {
        let (store, queue, clock) = setup();
        let task = running(&store, "ws-2", Stage::ApplyPending);
        cleanup_orphan_tasks(&store, 6_000).unwrap();
        store.confirm_apply(task.id, "alice", 6_000).unwrap();

        let report = recover_pending_tasks(&store, &queue, clock.as_ref())
            .await
            .unwrap();
        assert_eq!(report.apply_pending, 1);
        assert_eq!(report.triggered, vec!["ws-2".to_string()]);
        assert_eq!(queue.take_due().await, vec!["ws-2".to_string()]);
    }

    #[tokio::test]
    async fn sweep_reclaims_expired_leases() {
        let (store, queue, _clock) = setup();
        let task = store
            .create_task(Task::new("ws-2", TaskKind::Plan, 1_000))
            .unwrap();
        let Claim::Claimed(leased) = store
            .claim_task(task.id, TaskStatus::Pending, "worker-a", 60, 5_000, |_| {})
            .unwrap()
        else {
            panic!("claim failed");
        };
        assert_eq!(sweep_pending(&store, &queue, 5_030).await.unwrap(), 0);

        assert_eq!(sweep_pending(&store, &queue, 5_061).await.unwrap(), 1);
        assert_eq!(
            store.get_task(leased.id).unwrap().unwrap().status,
            TaskStatus::Pending
        );
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn sweep_requeues_reclaimed_apply() {
        let (store, queue, _clock) = setup();
        let task = store
            .create_task(Task::new("ws-1", TaskKind::PlanAndApply, 1_000))
            .unwrap();
        store
            .update_task(task.id, |t| {
                t.status = TaskStatus::ApplyPending;
                t.stage = Some(Stage::ApplyPending);
                Ok(())
            })
            .unwrap();
        store.confirm_apply(task.id, "alice", 4_000).unwrap();
        store
            .claim_task(task.id, TaskStatus::ApplyPending, "worker-a", 60, 5_000, |t| {
                t.stage = Some(Stage::Applying)
            })
            .unwrap();

        assert_eq!(sweep_pending(&store, &queue, 5_061).await.unwrap(), 1);
        let reclaimed = store.get_task(task.id).unwrap().unwrap();
        assert_eq!(reclaimed.status, TaskStatus::ApplyPending);
        assert!(reclaimed.is_apply_confirmed());
        assert_eq!(queue.len().await, 1);
    }
}
