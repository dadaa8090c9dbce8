//! CapacityPool — tracks pods and their slots for every agent pool.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use runplane_state::{AgentId, AgentPool, Clock, PoolId, StateStore, TaskId, TaskKind, TaskStatus};

use crate::backend::PodBackend;
use crate::error::{CapacityError, CapacityResult};
use crate::slot::{PodSnapshot, Slot, SlotAssignment, SlotStats, SlotStatus};

/// Tunables for the capacity pool.
#[derive(Debug, Clone)]
pub struct CapacityConfig {
    /// Pods silent for longer than this are skipped by allocation.
    pub heartbeat_timeout_secs: u64,
    /// Reservations older than this are released during reconciliation.
    pub reservation_ttl_secs: u64,
    /// Upper bound on a single backend call.
    pub backend_timeout: Duration,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 120,
            reservation_ttl_secs: 24 * 60 * 60,
            backend_timeout: Duration::from_secs(30),
        }
    }
}

struct PodState {
    agent_id: Option<AgentId>,
    last_heartbeat: u64,
    slots: Vec<Slot>,
    /// Set once the pod leaves the map; late allocators must not use it.
    retired: bool,
}

struct ManagedPod {
    name: String,
    pool_id: PoolId,
    created_at: u64,
    state: Mutex<PodState>,
}

impl ManagedPod {
    fn new(name: String, pool_id: PoolId, slots_per_pod: u32, created_at: u64, now: u64) -> Self {
        let slots = (0..slots_per_pod as usize).map(|i| Slot::idle(i, now)).collect();
        Self {
            name,
            pool_id,
            created_at,
            state: Mutex::new(PodState {
                agent_id: None,
                last_heartbeat: now,
                slots,
                retired: false,
            }),
        }
    }

    async fn snapshot(&self) -> PodSnapshot {
        let state = self.state.lock().await;
        PodSnapshot {
            name: self.name.clone(),
            pool_id: self.pool_id.clone(),
            agent_id: state.agent_id.clone(),
            created_at: self.created_at,
            last_heartbeat: state.last_heartbeat,
            slots: state.slots.clone(),
        }
    }
}

/// Finds the first slot on a pod that can take a task of `kind`.
///
/// A pod runs at most one PlanAndApply at a time; Plan and DriftCheck
/// share pods freely.
fn free_slot_for(state: &PodState, kind: TaskKind) -> Option<usize> {
    if state.retired {
        return None;
    }
    if kind == TaskKind::PlanAndApply && state.slots.iter().any(Slot::holds_apply) {
        return None;
    }
    state.slots.iter().position(Slot::is_idle)
}

/// In-process view of every pod the orchestrator manages.
pub struct CapacityPool {
    backend: Arc<dyn PodBackend>,
    clock: Arc<dyn Clock>,
    config: CapacityConfig,
    pods: RwLock<HashMap<String, Arc<ManagedPod>>>,
    name_seq: AtomicU64,
}

impl CapacityPool {
    pub fn new(backend: Arc<dyn PodBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            clock,
            config: CapacityConfig::default(),
            pods: RwLock::new(HashMap::new()),
            name_seq: AtomicU64::new(0),
        }
    }

    pub fn with_config(mut self, config: CapacityConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &CapacityConfig {
        &self.config
    }

    async fn pod(&self, pod_name: &str) -> CapacityResult<Arc<ManagedPod>> {
        self.pods
            .read()
            .await
            .get(pod_name)
            .cloned()
            .ok_or_else(|| CapacityError::PodNotFound(pod_name.to_string()))
    }

    /// Pods of a pool, ordered by creation time then name.
    async fn pods_in(&self, pool_id: &str) -> Vec<Arc<ManagedPod>> {
        let mut pods: Vec<_> = self
            .pods
            .read()
            .await
            .values()
            .filter(|p| p.pool_id == pool_id)
            .cloned()
            .collect();
        pods.sort_by(|a, b| (a.created_at, &a.name).cmp(&(b.created_at, &b.name)));
        pods
    }

    fn is_live(&self, state: &PodState, now: u64) -> bool {
        now.saturating_sub(state.last_heartbeat) <= self.config.heartbeat_timeout_secs
    }

    // ── Pod lifecycle ──────────────────────────────────────────────

    /// Provision a new pod with `pool.slots_per_pod` idle slots.
    pub async fn create_pod(&self, pool: &AgentPool) -> CapacityResult<PodSnapshot> {
        let now = self.clock.now_secs();
        let seq = self.name_seq.fetch_add(1, Ordering::Relaxed);
        let pod_name = format!("runplane-agent-{}-{}-{}", pool.pool_id, now, seq);

        tokio::time::timeout(
            self.config.backend_timeout,
            self.backend.create_pod(&pool.pool_id, &pod_name, now),
        )
        .await
        .map_err(|_| CapacityError::Timeout("create_pod"))?
        .map_err(|e| CapacityError::Backend(e.to_string()))?;

        let pod = Arc::new(ManagedPod::new(
            pod_name.clone(),
            pool.pool_id.clone(),
            pool.slots_per_pod,
            now,
            now,
        ));
        self.pods.write().await.insert(pod_name.clone(), pod.clone());
        info!(pool_id = %pool.pool_id, %pod_name, slots = pool.slots_per_pod, "pod created");
        Ok(pod.snapshot().await)
    }

    /// Delete a pod. Refuses pods with any non-idle slot.
    pub async fn delete_pod(&self, pod_name: &str) -> CapacityResult<()> {
        {
            let mut pods = self.pods.write().await;
            let pod = pods
                .get(pod_name)
                .cloned()
                .ok_or_else(|| CapacityError::PodNotFound(pod_name.to_string()))?;
            let mut state = pod.state.lock().await;
            if !state.slots.iter().all(Slot::is_idle) {
                return Err(CapacityError::PodBusy(pod_name.to_string()));
            }
            state.retired = true;
            pods.remove(pod_name);
        }

        tokio::time::timeout(self.config.backend_timeout, self.backend.delete_pod(pod_name))
            .await
            .map_err(|_| CapacityError::Timeout("delete_pod"))?
            .map_err(|e| CapacityError::Backend(e.to_string()))?;
        info!(%pod_name, "pod deleted");
        Ok(())
    }

    pub async fn list_pods(&self, pool_id: &str) -> Vec<PodSnapshot> {
        let mut out = Vec::new();
        for pod in self.pods_in(pool_id).await {
            out.push(pod.snapshot().await);
        }
        out
    }

    pub async fn pod_count(&self, pool_id: &str) -> usize {
        self.pods
            .read()
            .await
            .values()
            .filter(|p| p.pool_id == pool_id)
            .count()
    }

    /// Pods whose every slot is idle; the only deletion candidates.
    pub async fn find_idle_pods(&self, pool_id: &str) -> Vec<PodSnapshot> {
        self.list_pods(pool_id)
            .await
            .into_iter()
            .filter(PodSnapshot::is_fully_idle)
            .collect()
    }

    pub async fn pod_slots(&self, pod_name: &str) -> CapacityResult<Vec<Slot>> {
        let pod = self.pod(pod_name).await?;
        let state = pod.state.lock().await;
        Ok(state.slots.clone())
    }

    // ── Agents ─────────────────────────────────────────────────────

    /// Bind a connected agent to the pod it runs in.
    pub async fn register_agent(&self, pod_name: &str, agent_id: &str) -> CapacityResult<()> {
        let pod = self.pod(pod_name).await?;
        let mut state = pod.state.lock().await;
        state.agent_id = Some(agent_id.to_string());
        state.last_heartbeat = self.clock.now_secs();
        info!(%pod_name, %agent_id, "agent registered");
        Ok(())
    }

    pub async fn update_heartbeat(&self, pod_name: &str) -> CapacityResult<()> {
        let pod = self.pod(pod_name).await?;
        pod.state.lock().await.last_heartbeat = self.clock.now_secs();
        Ok(())
    }

    pub async fn find_pod_by_agent_id(&self, agent_id: &str) -> Option<PodSnapshot> {
        let pods: Vec<_> = self.pods.read().await.values().cloned().collect();
        for pod in pods {
            if pod.state.lock().await.agent_id.as_deref() == Some(agent_id) {
                return Some(pod.snapshot().await);
            }
        }
        None
    }

    // ── Slots ──────────────────────────────────────────────────────

    /// First live pod in the pool with a slot that can take `kind`.
    pub async fn find_pod_with_free_slot(
        &self,
        pool_id: &str,
        kind: TaskKind,
    ) -> CapacityResult<(String, usize)> {
        let now = self.clock.now_secs();
        for pod in self.pods_in(pool_id).await {
            let state = pod.state.lock().await;
            if !self.is_live(&state, now) {
                debug!(pod_name = %pod.name, "pod heartbeat stale, skipping");
                continue;
            }
            if let Some(slot) = free_slot_for(&state, kind) {
                return Ok((pod.name.clone(), slot));
            }
        }
        Err(CapacityError::NoFreeSlot(pool_id.to_string()))
    }

    /// Bind a task to a specific idle slot, marking it Reserved.
    pub async fn assign_task_to_slot(
        &self,
        pod_name: &str,
        slot: usize,
        task_id: TaskId,
        kind: TaskKind,
    ) -> CapacityResult<()> {
        let pod = self.pod(pod_name).await?;
        let mut state = pod.state.lock().await;
        if state.retired {
            return Err(CapacityError::PodNotFound(pod_name.to_string()));
        }
        let now = self.clock.now_secs();
        let entry = state.slots.get_mut(slot).ok_or_else(|| CapacityError::InvalidSlot {
            pod: pod_name.to_string(),
            slot,
        })?;
        if !entry.is_idle() {
            return Err(CapacityError::SlotBusy {
                pod: pod_name.to_string(),
                slot,
                status: entry.status,
            });
        }
        entry.bind(SlotStatus::Reserved, task_id, kind, now);
        debug!(%pod_name, slot, task_id, %kind, "task assigned to slot");
        Ok(())
    }

    /// Find and reserve a slot in one step under the pod lock.
    pub async fn allocate_slot(
        &self,
        pool_id: &str,
        task_id: TaskId,
        kind: TaskKind,
    ) -> CapacityResult<SlotAssignment> {
        let now = self.clock.now_secs();
        for pod in self.pods_in(pool_id).await {
            let mut state = pod.state.lock().await;
            if !self.is_live(&state, now) {
                continue;
            }
            if let Some(slot) = free_slot_for(&state, kind) {
                state.slots[slot].bind(SlotStatus::Reserved, task_id, kind, now);
                debug!(pod_name = %pod.name, slot, task_id, %kind, "slot allocated");
                return Ok(SlotAssignment {
                    pod_name: pod.name.clone(),
                    slot,
                    agent_id: state.agent_id.clone(),
                });
            }
        }
        Err(CapacityError::NoFreeSlot(pool_id.to_string()))
    }

    /// Reserve a slot on the pod hosting `agent_id`.
    pub async fn allocate_slot_on_agent(
        &self,
        agent_id: &str,
        task_id: TaskId,
        kind: TaskKind,
    ) -> CapacityResult<SlotAssignment> {
        let now = self.clock.now_secs();
        let pods: Vec<_> = self.pods.read().await.values().cloned().collect();
        for pod in pods {
            let mut state = pod.state.lock().await;
            if state.agent_id.as_deref() != Some(agent_id) {
                continue;
            }
            return match free_slot_for(&state, kind) {
                Some(slot) => {
                    state.slots[slot].bind(SlotStatus::Reserved, task_id, kind, now);
                    debug!(pod_name = %pod.name, slot, task_id, %agent_id, "slot allocated on agent pod");
                    Ok(SlotAssignment {
                        pod_name: pod.name.clone(),
                        slot,
                        agent_id: Some(agent_id.to_string()),
                    })
                }
                None => Err(CapacityError::NoFreeSlot(pod.pool_id.clone())),
            };
        }
        Err(CapacityError::NoFreeSlot(format!("agent {agent_id}")))
    }

    async fn set_slot(
        &self,
        pod_name: &str,
        slot: usize,
        f: impl FnOnce(&mut Slot, u64),
    ) -> CapacityResult<()> {
        let pod = self.pod(pod_name).await?;
        let mut state = pod.state.lock().await;
        let now = self.clock.now_secs();
        let entry = state.slots.get_mut(slot).ok_or_else(|| CapacityError::InvalidSlot {
            pod: pod_name.to_string(),
            slot,
        })?;
        f(entry, now);
        Ok(())
    }

    /// The task on this slot has been handed to its agent.
    pub async fn mark_slot_running(&self, pod_name: &str, slot: usize) -> CapacityResult<()> {
        self.set_slot(pod_name, slot, |s, now| {
            s.status = SlotStatus::Running;
            s.updated_at = now;
        })
        .await
    }

    /// Hold a slot for a task awaiting apply confirmation.
    pub async fn reserve_slot(&self, pod_name: &str, slot: usize, task_id: TaskId) -> CapacityResult<()> {
        self.set_slot(pod_name, slot, |s, now| {
            s.bind(SlotStatus::Reserved, task_id, TaskKind::PlanAndApply, now);
        })
        .await?;
        info!(%pod_name, slot, task_id, "slot reserved for apply confirmation");
        Ok(())
    }

    pub async fn release_slot(&self, pod_name: &str, slot: usize) -> CapacityResult<()> {
        let mut released = None;
        self.set_slot(pod_name, slot, |s, now| {
            released = s.task_id;
            s.clear(now);
        })
        .await?;
        if let Some(task_id) = released {
            debug!(%pod_name, slot, task_id, "slot released");
        }
        Ok(())
    }

    /// Pod, slot and agent currently bound to a task.
    pub async fn find_pod_by_task_id(&self, task_id: TaskId) -> CapacityResult<SlotAssignment> {
        let pods: Vec<_> = self.pods.read().await.values().cloned().collect();
        for pod in pods {
            let state = pod.state.lock().await;
            if let Some(slot) = state.slots.iter().position(|s| s.task_id == Some(task_id)) {
                return Ok(SlotAssignment {
                    pod_name: pod.name.clone(),
                    slot,
                    agent_id: state.agent_id.clone(),
                });
            }
        }
        Err(CapacityError::TaskNotPlaced(task_id))
    }

    /// Free whatever slot a task holds. Returns false if it held none.
    pub async fn release_task_slot(&self, task_id: TaskId) -> CapacityResult<bool> {
        match self.find_pod_by_task_id(task_id).await {
            Ok(placed) => {
                self.release_slot(&placed.pod_name, placed.slot).await?;
                Ok(true)
            }
            Err(CapacityError::TaskNotPlaced(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Keep a task's slot as Reserved while it awaits confirmation.
    pub async fn reserve_task_slot(&self, task_id: TaskId) -> CapacityResult<bool> {
        match self.find_pod_by_task_id(task_id).await {
            Ok(placed) => {
                self.reserve_slot(&placed.pod_name, placed.slot, task_id).await?;
                Ok(true)
            }
            Err(CapacityError::TaskNotPlaced(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn slot_stats(&self, pool_id: &str) -> SlotStats {
        let mut stats = SlotStats::default();
        for pod in self.pods_in(pool_id).await {
            for slot in pod.state.lock().await.slots.iter() {
                stats.total += 1;
                match slot.status {
                    SlotStatus::Running => stats.used += 1,
                    SlotStatus::Reserved => stats.reserved += 1,
                    SlotStatus::Idle => stats.idle += 1,
                }
            }
        }
        stats
    }

    // ── Reconciliation ─────────────────────────────────────────────

    /// Align the pool's pods with what the backend reports.
    ///
    /// Unknown live pods are adopted with idle slots, finished pods are
    /// deleted, and pods the backend no longer lists are forgotten.
    pub async fn sync_pods(&self, pool: &AgentPool) -> CapacityResult<()> {
        let observed = tokio::time::timeout(
            self.config.backend_timeout,
            self.backend.list_pods(&pool.pool_id),
        )
        .await
        .map_err(|_| CapacityError::Timeout("list_pods"))?
        .map_err(|e| CapacityError::Backend(e.to_string()))?;

        let now = self.clock.now_secs();
        let mut live = HashSet::new();
        let mut finished = Vec::new();
        {
            let mut pods = self.pods.write().await;
            for obs in &observed {
                if obs.phase.is_finished() {
                    finished.push(obs.name.clone());
                    continue;
                }
                live.insert(obs.name.clone());
                match pods.get(&obs.name) {
                    Some(pod) => pod.state.lock().await.last_heartbeat = now,
                    None => {
                        info!(pool_id = %pool.pool_id, pod_name = %obs.name, "adopting unmanaged pod");
                        pods.insert(
                            obs.name.clone(),
                            Arc::new(ManagedPod::new(
                                obs.name.clone(),
                                pool.pool_id.clone(),
                                pool.slots_per_pod,
                                obs.created_at,
                                now,
                            )),
                        );
                    }
                }
            }

            let gone: Vec<String> = pods
                .values()
                .filter(|p| p.pool_id == pool.pool_id && !live.contains(&p.name))
                .map(|p| p.name.clone())
                .collect();
            for name in gone {
                if let Some(pod) = pods.remove(&name) {
                    pod.state.lock().await.retired = true;
                    info!(pod_name = %name, "pod no longer exists, removed from management");
                }
            }
        }

        for name in finished {
            match tokio::time::timeout(self.config.backend_timeout, self.backend.delete_pod(&name)).await {
                Ok(Ok(())) => info!(pod_name = %name, "finished pod deleted"),
                Ok(Err(e)) => warn!(pod_name = %name, error = %e, "failed to delete finished pod"),
                Err(_) => warn!(pod_name = %name, "timed out deleting finished pod"),
            }
        }
        Ok(())
    }

    /// Free slots whose task is no longer live; mark ApplyPending ones Reserved.
    async fn sync_task_status(&self, pool_id: &str, store: &StateStore) -> CapacityResult<()> {
        let now = self.clock.now_secs();
        for pod in self.pods_in(pool_id).await {
            let mut state = pod.state.lock().await;
            for slot in state.slots.iter_mut() {
                let Some(task_id) = slot.task_id else {
                    continue;
                };
                let status = store.get_task(task_id)?.map(|t| t.status);
                match status {
                    Some(TaskStatus::Running) => {}
                    Some(TaskStatus::ApplyPending) => {
                        if slot.status != SlotStatus::Reserved {
                            slot.status = SlotStatus::Reserved;
                            slot.updated_at = now;
                            debug!(pod_name = %pod.name, slot = slot.index, task_id, "slot marked reserved");
                        }
                    }
                    // A Pending task holds a Reserved slot only while a
                    // dispatch is in progress.
                    Some(TaskStatus::Pending) if slot.status == SlotStatus::Reserved => {}
                    _ => {
                        info!(pod_name = %pod.name, slot = slot.index, task_id, "task no longer active, slot released");
                        slot.clear(now);
                    }
                }
            }
        }
        Ok(())
    }

    fn expire_reservations(&self, state: &mut PodState, pod_name: &str, now: u64) {
        for slot in state.slots.iter_mut() {
            if slot.status == SlotStatus::Reserved
                && now.saturating_sub(slot.updated_at) > self.config.reservation_ttl_secs
            {
                warn!(%pod_name, slot = slot.index, task_id = ?slot.task_id, "reservation expired");
                slot.clear(now);
            }
        }
    }

    /// Full reconciliation pass for one pool.
    pub async fn reconcile_pods(&self, pool: &AgentPool, store: &StateStore) -> CapacityResult<()> {
        self.sync_pods(pool).await?;
        if let Err(e) = self.sync_task_status(&pool.pool_id, store).await {
            warn!(pool_id = %pool.pool_id, error = %e, "failed to sync task status to slots");
        }
        let now = self.clock.now_secs();
        for pod in self.pods_in(&pool.pool_id).await {
            let mut state = pod.state.lock().await;
            self.expire_reservations(&mut state, &pod.name, now);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryPodBackend, ObservedPod, PodPhase};
    use runplane_state::{ExecutionMode, ManualClock, Task, Workspace};

    struct Fixture {
        backend: Arc<InMemoryPodBackend>,
        clock: Arc<ManualClock>,
        capacity: CapacityPool,
        pool: AgentPool,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(InMemoryPodBackend::new());
        let clock = Arc::new(ManualClock::new(10_000));
        let capacity = CapacityPool::new(backend.clone(), clock.clone());
        Fixture {
            backend,
            clock,
            capacity,
            pool: AgentPool::kubernetes("pool-a", 0, 5),
        }
    }

    async fn assert_conserved(capacity: &CapacityPool, pool_id: &str) {
        let stats = capacity.slot_stats(pool_id).await;
        assert_eq!(stats.used + stats.reserved + stats.idle, stats.total);
    }

    #[tokio::test]
    async fn create_pod_uses_pool_slot_count() {
        let mut f = fixture();
        f.pool.slots_per_pod = 4;
        let pod = f.capacity.create_pod(&f.pool).await.unwrap();

        assert_eq!(pod.slots.len(), 4);
        assert!(pod.is_fully_idle());
        assert_eq!(f.backend.pod_names(), vec![pod.name.clone()]);
        assert_eq!(f.capacity.pod_count("pool-a").await, 1);
    }

    #[tokio::test]
    async fn create_failure_leaves_no_pod() {
        let f = fixture();
        f.backend.set_fail_creates(true);
        let err = f.capacity.create_pod(&f.pool).await.unwrap_err();
        assert!(matches!(err, CapacityError::Backend(_)));
        assert_eq!(f.capacity.pod_count("pool-a").await, 0);
    }

    #[tokio::test]
    async fn allocate_release_conserves_slots() {
        let f = fixture();
        f.capacity.create_pod(&f.pool).await.unwrap();
        f.capacity.create_pod(&f.pool).await.unwrap();

        let mut placed = Vec::new();
        for task_id in 1..=4 {
            placed.push(f.capacity.allocate_slot("pool-a", task_id, TaskKind::Plan).await.unwrap());
            assert_conserved(&f.capacity, "pool-a").await;
        }
        f.capacity.mark_slot_running(&placed[0].pod_name, placed[0].slot).await.unwrap();
        f.capacity.release_slot(&placed[1].pod_name, placed[1].slot).await.unwrap();
        assert_conserved(&f.capacity, "pool-a").await;

        let stats = f.capacity.slot_stats("pool-a").await;
        assert_eq!(stats, SlotStats { total: 6, used: 1, reserved: 2, idle: 3 });
    }

    #[tokio::test]
    async fn one_plan_and_apply_per_pod() {
        let f = fixture();
        let pod = f.capacity.create_pod(&f.pool).await.unwrap();

        f.capacity.allocate_slot("pool-a", 1, TaskKind::PlanAndApply).await.unwrap();
        let err = f.capacity.allocate_slot("pool-a", 2, TaskKind::PlanAndApply).await.unwrap_err();
        assert!(matches!(err, CapacityError::NoFreeSlot(_)));

        // Plans still fit alongside it.
        let plan = f.capacity.allocate_slot("pool-a", 3, TaskKind::Plan).await.unwrap();
        assert_eq!(plan.pod_name, pod.name);
    }

    #[tokio::test]
    async fn assign_requires_idle_slot() {
        let f = fixture();
        let pod = f.capacity.create_pod(&f.pool).await.unwrap();
        f.capacity.assign_task_to_slot(&pod.name, 0, 1, TaskKind::Plan).await.unwrap();

        let err = f.capacity.assign_task_to_slot(&pod.name, 0, 2, TaskKind::Plan).await.unwrap_err();
        assert!(matches!(err, CapacityError::SlotBusy { slot: 0, .. }));
        let err = f.capacity.assign_task_to_slot(&pod.name, 9, 2, TaskKind::Plan).await.unwrap_err();
        assert!(matches!(err, CapacityError::InvalidSlot { slot: 9, .. }));
    }

    #[tokio::test]
    async fn stale_heartbeat_pods_are_skipped() {
        let f = fixture();
        let pod = f.capacity.create_pod(&f.pool).await.unwrap();
        f.clock.advance_secs(121);

        assert!(f.capacity.find_pod_with_free_slot("pool-a", TaskKind::Plan).await.is_err());
        f.capacity.update_heartbeat(&pod.name).await.unwrap();
        let (name, slot) = f.capacity.find_pod_with_free_slot("pool-a", TaskKind::Plan).await.unwrap();
        assert_eq!((name, slot), (pod.name, 0));
    }

    #[tokio::test]
    async fn delete_refuses_busy_pod() {
        let f = fixture();
        let pod = f.capacity.create_pod(&f.pool).await.unwrap();
        f.capacity.allocate_slot("pool-a", 1, TaskKind::Plan).await.unwrap();

        assert!(matches!(
            f.capacity.delete_pod(&pod.name).await,
            Err(CapacityError::PodBusy(_))
        ));
        assert!(f.capacity.find_idle_pods("pool-a").await.is_empty());

        f.capacity.release_task_slot(1).await.unwrap();
        f.capacity.delete_pod(&pod.name).await.unwrap();
        assert!(f.backend.pod_names().is_empty());
    }

    #[tokio::test]
    async fn agent_registration_and_lookup() {
        let f = fixture();
        let pod = f.capacity.create_pod(&f.pool).await.unwrap();
        f.capacity.register_agent(&pod.name, "agent-1").await.unwrap();

        let found = f.capacity.find_pod_by_agent_id("agent-1").await.unwrap();
        assert_eq!(found.name, pod.name);

        let placed = f.capacity.allocate_slot_on_agent("agent-1", 5, TaskKind::Plan).await.unwrap();
        assert_eq!(placed.agent_id.as_deref(), Some("agent-1"));
        assert_eq!(f.capacity.find_pod_by_task_id(5).await.unwrap(), placed);
        assert!(f.capacity.allocate_slot_on_agent("agent-2", 6, TaskKind::Plan).await.is_err());
    }

    #[tokio::test]
    async fn reserve_task_slot_keeps_binding() {
        let f = fixture();
        f.capacity.create_pod(&f.pool).await.unwrap();
        let placed = f.capacity.allocate_slot("pool-a", 1, TaskKind::PlanAndApply).await.unwrap();
        f.capacity.mark_slot_running(&placed.pod_name, placed.slot).await.unwrap();

        assert!(f.capacity.reserve_task_slot(1).await.unwrap());
        let slots = f.capacity.pod_slots(&placed.pod_name).await.unwrap();
        assert_eq!(slots[placed.slot].status, SlotStatus::Reserved);
        assert_eq!(slots[placed.slot].task_id, Some(1));
        assert!(!f.capacity.reserve_task_slot(99).await.unwrap());
    }

    #[tokio::test]
    async fn sync_adopts_removes_and_cleans_finished() {
        let f = fixture();
        let ours = f.capacity.create_pod(&f.pool).await.unwrap();
        f.backend.insert(ObservedPod {
            name: "stray".to_string(),
            pool_id: "pool-a".to_string(),
            phase: PodPhase::Running,
            created_at: 9_000,
        });
        f.backend.insert(ObservedPod {
            name: "crashed".to_string(),
            pool_id: "pool-a".to_string(),
            phase: PodPhase::Failed,
            created_at: 9_000,
        });

        f.capacity.sync_pods(&f.pool).await.unwrap();
        let names: Vec<_> = f.capacity.list_pods("pool-a").await.into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["stray".to_string(), ours.name.clone()]);
        assert!(!f.backend.pod_names().contains(&"crashed".to_string()));

        f.backend.remove(&ours.name);
        f.capacity.sync_pods(&f.pool).await.unwrap();
        assert_eq!(f.capacity.pod_count("pool-a").await, 1);
    }

    #[tokio::test]
    async fn reconcile_follows_task_status() {
        let f = fixture();
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_workspace(&Workspace::new("ws-1", ExecutionMode::Kubernetes).with_pool("pool-a"))
            .unwrap();
        let done = store.create_task(Task::new("ws-1", TaskKind::Plan, 1)).unwrap();
        let waiting = store.create_task(Task::new("ws-1", TaskKind::PlanAndApply, 1)).unwrap();
        store
            .update_task(done.id, |t| {
                t.transition_to(TaskStatus::Running)?;
                t.finish(TaskStatus::Success, 2)
            })
            .unwrap();
        store
            .update_task(waiting.id, |t| {
                t.transition_to(TaskStatus::Running)?;
                t.transition_to(TaskStatus::ApplyPending)
            })
            .unwrap();

        f.capacity.create_pod(&f.pool).await.unwrap();
        let a = f.capacity.allocate_slot("pool-a", done.id, TaskKind::Plan).await.unwrap();
        let b = f.capacity.allocate_slot("pool-a", waiting.id, TaskKind::PlanAndApply).await.unwrap();
        f.capacity.mark_slot_running(&a.pod_name, a.slot).await.unwrap();
        f.capacity.mark_slot_running(&b.pod_name, b.slot).await.unwrap();

        f.capacity.reconcile_pods(&f.pool, &store).await.unwrap();
        let stats = f.capacity.slot_stats("pool-a").await;
        assert_eq!(stats, SlotStats { total: 3, used: 0, reserved: 1, idle: 2 });

        // Reservation outlives its TTL.
        f.clock.advance_secs(24 * 60 * 60 + 1);
        f.capacity.reconcile_pods(&f.pool, &store).await.unwrap();
        assert_eq!(f.capacity.slot_stats("pool-a").await.reserved, 0);
    }

    #[test]
    fn utilization_counts_reserved() {
        let stats = SlotStats { total: 6, used: 5, reserved: 1, idle: 0 };
        assert_eq!(stats.utilization(), 1.0);
        assert_eq!(SlotStats::default().utilization(), 0.0);
    }
}
