//! Orchestrator integration tests.
//!
//! Wires the real subsystems together around an in-memory (or on-disk)
//! store, an in-memory pod backend and the in-process agent registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use runplane_capacity::InMemoryPodBackend;
use runplane_scheduler::{AgentAction, DispatchError, DispatchOutcome};
use runplane_state::{
    AgentPool, ExecutionMode, ManualClock, PoolKind, Stage, StateStore, Task, TaskId, TaskKind,
    TaskOrigin, TaskStatus, Workspace,
};
use runplaned::{CommandSpec, LocalExecution, Orchestrator, RunplaneConfig};

fn orchestrator(config: RunplaneConfig, store: StateStore) -> Arc<Orchestrator> {
    let orchestrator = Arc::new(Orchestrator::new(
        config,
        store,
        Arc::new(ManualClock::new(1_760_000_000)),
        Arc::new(InMemoryPodBackend::new()),
    ));
    orchestrator.seed().unwrap();
    orchestrator
}

fn static_pool(pool_id: &str) -> AgentPool {
    let mut pool = AgentPool::kubernetes(pool_id, 0, 0);
    pool.kind = PoolKind::Static;
    pool
}

async fn wait_for_status(store: &StateStore, id: TaskId, status: TaskStatus) -> Task {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let task = store.get_task(id).unwrap().unwrap();
            if task.status == status {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn submitted_task_reaches_connected_agent() {
    let mut config = RunplaneConfig::default();
    config.dispatch.workers = 2;
    config.pools.push(static_pool("static-a"));
    config
        .workspaces
        .push(Workspace::new("ws-1", ExecutionMode::Agent).with_pool("static-a"));
    let orch = orchestrator(config, StateStore::open_in_memory().unwrap());

    let mut rx = orch
        .agents()
        .connect("agent-1", Some("static-a".into()), None)
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.run(shutdown_rx).await })
    };

    let task = orch
        .submit(Task::new("ws-1", TaskKind::Plan, 1_000))
        .await
        .unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.task_id, task.id);
    assert_eq!(msg.action, AgentAction::Plan);

    let stored = orch.store().get_task(task.id).unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Running);
    assert_eq!(stored.agent_id.as_deref(), Some("agent-1"));
    assert_eq!(stored.stage, Some(Stage::Planning));

    shutdown_tx.send(true).unwrap();
    runner.await.unwrap().unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn local_plan_and_apply_waits_for_confirmation() {
    let succeed = CommandSpec {
        program: "true".into(),
        args: Vec::new(),
        working_dir: None,
        per_workspace_dir: false,
    };
    let mut config = RunplaneConfig::default();
    config.local = LocalExecution {
        plan: Some(succeed.clone()),
        apply: Some(succeed),
    };
    config
        .workspaces
        .push(Workspace::new("ws-local", ExecutionMode::Local));
    let orch = orchestrator(config, StateStore::open_in_memory().unwrap());

    let task = orch
        .submit(Task::new("ws-local", TaskKind::PlanAndApply, 1_000))
        .await
        .unwrap();
    let outcome = orch.dispatcher().try_dispatch("ws-local").await.unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::Started {
            task_id: task.id,
            agent_id: None
        }
    );
    wait_for_status(orch.store(), task.id, TaskStatus::ApplyPending).await;

    // Nothing moves the task on without an operator.
    assert_eq!(
        orch.dispatcher().try_dispatch("ws-local").await.unwrap(),
        DispatchOutcome::Idle
    );
    let err = orch
        .dispatcher()
        .execute_confirmed_apply("ws-local", task.id)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::UnconfirmedApply { .. }));

    orch.confirm_apply(task.id, "alice").await.unwrap();
    let applied = wait_for_status(orch.store(), task.id, TaskStatus::Applied).await;
    assert_eq!(applied.apply_confirmed_by.as_deref(), Some("alice"));
}

#[tokio::test]
async fn kubernetes_pool_scales_from_zero_and_frees_slot() {
    let mut config = RunplaneConfig::default();
    config.pools.push(AgentPool::kubernetes("pool-k", 0, 2));
    config
        .workspaces
        .push(Workspace::new("ws-k", ExecutionMode::Kubernetes).with_pool("pool-k"));
    let orch = orchestrator(config, StateStore::open_in_memory().unwrap());

    let task = orch
        .submit(Task::new("ws-k", TaskKind::Plan, 1_000))
        .await
        .unwrap();

    let results = orch.autoscaler().run_cycle().await.unwrap();
    assert_eq!(results, vec![("pool-k".to_string(), 1, true)]);
    let pod = orch.capacity().list_pods("pool-k").await.remove(0);

    let mut rx = orch
        .agents()
        .connect("agent-k", Some("pool-k".into()), Some(&pod.name))
        .await
        .unwrap();

    let outcome = orch.dispatcher().try_dispatch("ws-k").await.unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::Started {
            task_id: task.id,
            agent_id: Some("agent-k".into())
        }
    );
    assert_eq!(rx.recv().await.unwrap().task_id, task.id);
    assert_eq!(orch.capacity().slot_stats("pool-k").await.used, 1);

    // The agent reports completion.
    orch.store()
        .update_task(task.id, |t| t.finish(TaskStatus::Success, 1_760_000_100))
        .unwrap();
    orch.dispatcher().on_task_completed(task.id).await.unwrap();

    let stats = orch.capacity().slot_stats("pool-k").await;
    assert_eq!((stats.used, stats.reserved), (0, 0));
}

#[tokio::test]
async fn restart_recovers_state_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runplane.redb");

    let (interrupted, parked, triggered, manual) = {
        let store = StateStore::open(&path).unwrap();
        store
            .put_workspace(&Workspace::new("ws-1", ExecutionMode::Agent).with_pool("static-a"))
            .unwrap();
        let running = |stage: Stage| {
            let task = store
                .create_task(Task::new("ws-1", TaskKind::PlanAndApply, 1_000))
                .unwrap();
            store
                .update_task(task.id, |t| {
                    t.transition_to(TaskStatus::Running)?;
                    t.stage = Some(stage);
                    t.agent_id = Some("agent-gone".into());
                    Ok(())
                })
                .unwrap()
        };
        let interrupted = running(Stage::Planning);
        let parked = running(Stage::ApplyPending);
        let triggered = store
            .create_task(Task::new("ws-1", TaskKind::Plan, 1_000).with_origin(TaskOrigin::RunTrigger))
            .unwrap();
        let manual = store
            .create_task(Task::new("ws-1", TaskKind::Plan, 1_000))
            .unwrap();
        (interrupted.id, parked.id, triggered.id, manual.id)
    };

    let mut config = RunplaneConfig::default();
    config.store.path = path.clone();
    let orch = orchestrator(config, StateStore::open(&path).unwrap());
    let report = orch.recover().await.unwrap();

    assert_eq!(report.failed, vec![interrupted]);
    assert_eq!(report.restored, vec![parked]);
    assert_eq!(report.cancelled, vec![triggered]);
    assert_eq!(report.apply_pending, 1);
    assert_eq!(report.triggered, vec!["ws-1".to_string()]);

    let store = orch.store();
    assert_eq!(store.get_task(interrupted).unwrap().unwrap().status, TaskStatus::Failed);
    assert_eq!(store.get_task(parked).unwrap().unwrap().status, TaskStatus::ApplyPending);
    assert_eq!(store.get_task(triggered).unwrap().unwrap().status, TaskStatus::Cancelled);
    assert_eq!(store.get_task(manual).unwrap().unwrap().status, TaskStatus::Pending);
    assert_eq!(orch.queue().take_due().await, vec!["ws-1".to_string()]);
}
