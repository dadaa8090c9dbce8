//! Autoscaler — slot-driven pod scaling for Kubernetes pools.
//!
//! Every tick, for each Kubernetes pool: reconcile the capacity view,
//! restart pods whose agent never showed up, honour freeze windows, compute
//! the desired pod count and apply the delta. Workspaces of the pool with
//! Pending work are then handed back to the dispatch queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use runplane_capacity::{BoxFuture, CapacityPool, SlotStats};
use runplane_scheduler::{DispatchQueue, ScaleUpCallback};
use runplane_state::{AgentPool, Clock, PoolId, PoolKind, PoolTaskSummary, StateStore};

use crate::error::{ScaleError, ScaleResult};
use crate::freeze::{FreezeStatus, pool_freeze_status};
use crate::restart::{RestartDecision, RestartPolicy, RestartTracker};

/// Autoscaler tunables.
#[derive(Debug, Clone)]
pub struct AutoscaleConfig {
    /// Utilization above which one pod is added.
    pub scale_up_utilization: f64,
    /// Utilization below which one idle pod may be removed.
    pub scale_down_utilization: f64,
    pub restart: RestartPolicy,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            scale_up_utilization: 0.8,
            scale_down_utilization: 0.2,
            restart: RestartPolicy::default(),
        }
    }
}

/// Inputs to one desired-capacity computation.
#[derive(Debug, Clone, Copy)]
pub struct CapacitySnapshot<'a> {
    pub pods: u32,
    pub pods_with_running: u32,
    pub stats: SlotStats,
    pub tasks: &'a PoolTaskSummary,
}

/// Desired pod count for a pool, clamped to its replica bounds.
///
/// Reservations are a floor: the pool never shrinks below the pods needed
/// to hold every reserved slot.
pub fn desired_pods(pool: &AgentPool, config: &AutoscaleConfig, snap: &CapacitySnapshot<'_>) -> u32 {
    let min = pool.min_replicas;
    let max = pool.max_replicas.max(min);

    if snap.pods == 0 || snap.stats.total == 0 {
        let mut desired = min;
        if snap.tasks.pending > 0 {
            desired = desired.max(1);
        }
        return desired.clamp(min, max);
    }

    let current = snap.pods;
    let mut desired = current;

    // Unblocked PlanAndApply work needs a pod that is not already busy.
    let required = snap.pods_with_running + snap.tasks.unblocked_pending_apply;
    if snap.tasks.unblocked_pending_apply > 0 && required > current {
        desired = required;
    } else {
        let utilization = snap.stats.utilization();
        if utilization > config.scale_up_utilization {
            desired = current + 1;
        } else if utilization < config.scale_down_utilization
            && snap.stats.used == 0
            && snap.tasks.unblocked_pending == 0
        {
            desired = current.saturating_sub(1);
        }
    }

    if snap.stats.reserved > 0 {
        let per_pod = pool.slots_per_pod.max(1);
        desired = desired.max(snap.stats.reserved.div_ceil(per_pod));
    }

    desired.clamp(min, max)
}

fn wall_clock(clock: &dyn Clock) -> ScaleResult<DateTime<Utc>> {
    let secs = clock.now_secs();
    i64::try_from(secs)
        .ok()
        .and_then(|s| DateTime::from_timestamp(s, 0))
        .ok_or(ScaleError::ClockOutOfRange(secs))
}

/// Keeps each Kubernetes pool's pod count in line with its workload.
pub struct Autoscaler {
    store: StateStore,
    capacity: Arc<CapacityPool>,
    queue: DispatchQueue,
    clock: Arc<dyn Clock>,
    config: AutoscaleConfig,
    restarts: Mutex<HashMap<PoolId, RestartTracker>>,
}

impl Autoscaler {
    pub fn new(
        store: StateStore,
        capacity: Arc<CapacityPool>,
        queue: DispatchQueue,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            capacity,
            queue,
            clock,
            config: AutoscaleConfig::default(),
            restarts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: AutoscaleConfig) -> Self {
        self.config = config;
        self
    }

    /// Hook for the dispatcher: provision capacity for a pool on demand.
    pub fn scale_up_callback(self: &Arc<Self>) -> ScaleUpCallback {
        let scaler = Arc::clone(self);
        Arc::new(move |pool_id: PoolId| -> BoxFuture<'static, anyhow::Result<()>> {
            let scaler = scaler.clone();
            Box::pin(async move {
                scaler.ensure_pods_for_pool(&pool_id).await?;
                Ok(())
            })
        })
    }

    fn pool(&self, pool_id: &str) -> ScaleResult<AgentPool> {
        self.store
            .get_pool(pool_id)?
            .ok_or_else(|| ScaleError::PoolNotFound(pool_id.to_string()))
    }

    // ── Scaling ────────────────────────────────────────────────────

    /// Reconcile and scale one pool. Returns `(pod count, scaled)`.
    pub async fn auto_scale_pods(&self, pool: &AgentPool) -> ScaleResult<(u32, bool)> {
        self.capacity.reconcile_pods(pool, &self.store).await?;
        self.scale_reconciled(pool).await
    }

    /// Make sure a pool that just received work has at least one pod, then
    /// run a normal scaling pass.
    pub async fn ensure_pods_for_pool(&self, pool_id: &str) -> ScaleResult<(u32, bool)> {
        let pool = self.pool(pool_id)?;
        if pool.kind != PoolKind::Kubernetes {
            debug!(%pool_id, "not a kubernetes pool, nothing to ensure");
            return Ok((self.capacity.pod_count(pool_id).await as u32, false));
        }
        self.capacity.reconcile_pods(&pool, &self.store).await?;

        let mut created = false;
        let frozen = pool_freeze_status(&pool, wall_clock(self.clock.as_ref())?).is_frozen();
        if !frozen && self.capacity.pod_count(pool_id).await == 0 {
            let target = pool.min_replicas.max(1).min(pool.max_replicas.max(1));
            info!(%pool_id, target, "pool has no pods, provisioning");
            created = self.create_pods(&pool, target).await > 0;
        }

        let (count, scaled) = self.scale_reconciled(&pool).await?;
        Ok((count, scaled || created))
    }

    async fn scale_reconciled(&self, pool: &AgentPool) -> ScaleResult<(u32, bool)> {
        let pool_id = &pool.pool_id;

        let freeze = pool_freeze_status(pool, wall_clock(self.clock.as_ref())?);
        if let FreezeStatus::Frozen { reason } = &freeze {
            let mut deleted = 0;
            for pod in self.capacity.find_idle_pods(pool_id).await {
                match self.capacity.delete_pod(&pod.name).await {
                    Ok(()) => deleted += 1,
                    Err(e) => warn!(%pool_id, pod_name = %pod.name, error = %e, "failed to delete idle pod"),
                }
            }
            let count = self.capacity.pod_count(pool_id).await as u32;
            info!(%pool_id, %reason, deleted, remaining = count, "pool frozen");
            return Ok((count, deleted > 0));
        }

        let pods = self.capacity.list_pods(pool_id).await;
        let stats = self.capacity.slot_stats(pool_id).await;
        let tasks = self.store.pool_task_summary(pool_id)?;
        let current = pods.len() as u32;

        if tasks.apply_pending > stats.reserved {
            warn!(
                %pool_id,
                apply_pending = tasks.apply_pending,
                reserved = stats.reserved,
                task_ids = ?tasks.apply_pending_task_ids,
                "apply-pending tasks without a reserved slot"
            );
        }

        let snap = CapacitySnapshot {
            pods: current,
            pods_with_running: pods.iter().filter(|p| p.has_running()).count() as u32,
            stats,
            tasks: &tasks,
        };
        let desired = desired_pods(pool, &self.config, &snap);
        debug!(
            %pool_id,
            current,
            desired,
            total = stats.total,
            used = stats.used,
            reserved = stats.reserved,
            utilization = stats.utilization(),
            pending = tasks.pending,
            "scaling evaluated"
        );

        if desired == current {
            return Ok((current, false));
        }

        if desired > current {
            let created = self.create_pods(pool, desired - current).await;
            if created > 0 {
                info!(%pool_id, from = current, to = current + created, "scaled up");
                for workspace_id in &tasks.pending_workspaces {
                    self.queue.trigger(workspace_id).await;
                }
            }
            return Ok((current + created, created > 0));
        }

        // Re-read: a plan may have finished into ApplyPending since the summary.
        let fresh = self.store.pool_task_summary(pool_id)?;
        if fresh.apply_pending > 0 {
            info!(%pool_id, apply_pending = fresh.apply_pending, "skipping scale-down while applies await confirmation");
            return Ok((current, false));
        }

        let wanted = current - desired;
        let idle = self.capacity.find_idle_pods(pool_id).await;
        if (idle.len() as u32) < wanted {
            warn!(%pool_id, wanted, idle = idle.len(), "fewer idle pods than requested scale-down");
        }
        let mut deleted = 0;
        for pod in idle.iter().take(wanted as usize) {
            match self.capacity.delete_pod(&pod.name).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!(%pool_id, pod_name = %pod.name, error = %e, "failed to delete idle pod"),
            }
        }
        if deleted > 0 {
            info!(%pool_id, from = current, to = current - deleted, "scaled down");
        }
        Ok((current - deleted, deleted > 0))
    }

    async fn create_pods(&self, pool: &AgentPool, count: u32) -> u32 {
        let mut created = 0;
        for _ in 0..count {
            match self.capacity.create_pod(pool).await {
                Ok(pod) => {
                    debug!(pool_id = %pool.pool_id, pod_name = %pod.name, "pod created");
                    created += 1;
                }
                Err(e) => {
                    warn!(pool_id = %pool.pool_id, error = %e, "pod creation failed");
                    break;
                }
            }
        }
        created
    }

    // ── Unhealthy pods ─────────────────────────────────────────────

    /// Restart pods that outlived the grace period without an agent.
    ///
    /// Nothing is touched while the pool has Running or ApplyPending work.
    /// Returns the names of replacement pods.
    pub async fn check_and_restart_unhealthy_pods(&self, pool: &AgentPool) -> ScaleResult<Vec<String>> {
        let pool_id = &pool.pool_id;
        let tasks = self.store.pool_task_summary(pool_id)?;
        if tasks.in_flight() > 0 {
            debug!(%pool_id, in_flight = tasks.in_flight(), "work in flight, skipping unhealthy pod check");
            return Ok(Vec::new());
        }

        let now = self.clock.now_secs();
        let pods = self.capacity.list_pods(pool_id).await;
        let mut restarts = self.restarts.lock().await;
        let tracker = restarts
            .entry(pool_id.clone())
            .or_insert_with(|| RestartTracker::new(self.config.restart));
        tracker.retain_pods(pods.iter().map(|p| p.name.as_str()));

        let grace = tracker.policy().grace_period.as_secs();
        let unhealthy: Vec<_> = pods
            .iter()
            .filter(|p| p.agent_id.is_none() && now.saturating_sub(p.created_at) >= grace)
            .collect();
        if unhealthy.is_empty() {
            if !tracker.is_empty() {
                debug!(%pool_id, "all pods healthy, clearing restart history");
            }
            tracker.clear();
            return Ok(Vec::new());
        }

        let mut replaced = Vec::new();
        for pod in unhealthy {
            match tracker.decide(&pod.name, now) {
                RestartDecision::Backoff { remaining } => {
                    debug!(%pool_id, pod_name = %pod.name, remaining_secs = remaining.as_secs(), "unhealthy pod in restart backoff");
                }
                RestartDecision::GiveUp {
                    restart_count,
                    first_unhealthy_at,
                } => {
                    error!(
                        %pool_id,
                        pod_name = %pod.name,
                        restart_count,
                        first_unhealthy_at,
                        "agent never registered after repeated restarts; manual intervention required"
                    );
                }
                RestartDecision::Restart { attempt } => {
                    info!(%pool_id, pod_name = %pod.name, attempt, "restarting unhealthy pod");
                    if let Err(e) = self.capacity.delete_pod(&pod.name).await {
                        warn!(%pool_id, pod_name = %pod.name, error = %e, "failed to delete unhealthy pod");
                        continue;
                    }
                    match self.capacity.create_pod(pool).await {
                        Ok(new_pod) => {
                            tracker.record_restart(&pod.name, Some(&new_pod.name), now);
                            replaced.push(new_pod.name);
                        }
                        Err(e) => {
                            warn!(%pool_id, error = %e, "failed to create replacement pod");
                            tracker.record_restart(&pod.name, None, now);
                        }
                    }
                }
            }
        }
        Ok(replaced)
    }

    // ── Control loop ───────────────────────────────────────────────

    /// One pass over every Kubernetes pool.
    pub async fn run_cycle(&self) -> ScaleResult<Vec<(PoolId, u32, bool)>> {
        let mut results = Vec::new();
        for pool in self.store.list_pools()? {
            if pool.kind != PoolKind::Kubernetes {
                continue;
            }
            let pool_id = pool.pool_id.clone();

            if let Err(e) = self.capacity.reconcile_pods(&pool, &self.store).await {
                warn!(%pool_id, error = %e, "pod reconciliation failed");
                continue;
            }
            if let Err(e) = self.check_and_restart_unhealthy_pods(&pool).await {
                warn!(%pool_id, error = %e, "unhealthy pod check failed");
            }
            match self.scale_reconciled(&pool).await {
                Ok((count, scaled)) => results.push((pool_id.clone(), count, scaled)),
                Err(e) => warn!(%pool_id, error = %e, "scaling failed"),
            }

            match self.store.pool_task_summary(&pool_id) {
                Ok(tasks) => {
                    for workspace_id in &tasks.pending_workspaces {
                        self.queue.trigger(workspace_id).await;
                    }
                }
                Err(e) => warn!(%pool_id, error = %e, "failed to list pending workspaces"),
            }
        }
        Ok(results)
    }

    /// Run the autoscaler loop.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "autoscaler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "autoscaler cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}
