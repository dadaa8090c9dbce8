//! Cluster-side pod operations.
//!
//! The capacity pool never talks to a cluster API directly; it goes through
//! [`PodBackend`]. [`InMemoryPodBackend`] keeps pods in a map and is used for
//! local runs and tests.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use runplane_state::PoolId;

/// Boxed future returned by collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Lifecycle phase reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl PodPhase {
    /// Pods that exited can never serve work again.
    pub fn is_finished(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// A pod as listed by the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedPod {
    pub name: String,
    pub pool_id: PoolId,
    pub phase: PodPhase,
    /// Unix timestamp (seconds).
    pub created_at: u64,
}

/// Create, delete and list agent pods for a pool.
pub trait PodBackend: Send + Sync {
    fn create_pod<'a>(
        &'a self,
        pool_id: &'a str,
        pod_name: &'a str,
        created_at: u64,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Deleting a pod that does not exist is not an error.
    fn delete_pod<'a>(&'a self, pod_name: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;

    fn list_pods<'a>(&'a self, pool_id: &'a str) -> BoxFuture<'a, anyhow::Result<Vec<ObservedPod>>>;
}

/// A backend that keeps pods in process memory.
#[derive(Debug, Default)]
pub struct InMemoryPodBackend {
    pods: Mutex<BTreeMap<String, ObservedPod>>,
    fail_creates: AtomicBool,
}

impl InMemoryPodBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `create_pod` calls fail.
    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Override the phase of a pod, as if the cluster reported it.
    pub fn set_phase(&self, pod_name: &str, phase: PodPhase) {
        if let Some(pod) = self.lock().get_mut(pod_name) {
            pod.phase = phase;
        }
    }

    /// Insert a pod the pool has not created itself.
    pub fn insert(&self, pod: ObservedPod) {
        self.lock().insert(pod.name.clone(), pod);
    }

    /// Drop a pod without going through the pool.
    pub fn remove(&self, pod_name: &str) {
        self.lock().remove(pod_name);
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, ObservedPod>> {
        self.pods.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PodBackend for InMemoryPodBackend {
    fn create_pod<'a>(
        &'a self,
        pool_id: &'a str,
        pod_name: &'a str,
        created_at: u64,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            if self.fail_creates.load(Ordering::SeqCst) {
                anyhow::bail!("pod creation rejected for pool {pool_id}");
            }
            self.insert(ObservedPod {
                name: pod_name.to_string(),
                pool_id: pool_id.to_string(),
                phase: PodPhase::Running,
                created_at,
            });
            debug!(%pool_id, %pod_name, "in-memory pod created");
            Ok(())
        })
    }

    fn delete_pod<'a>(&'a self, pod_name: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.remove(pod_name);
            Ok(())
        })
    }

    fn list_pods<'a>(&'a self, pool_id: &'a str) -> BoxFuture<'a, anyhow::Result<Vec<ObservedPod>>> {
        Box::pin(async move {
            Ok(self
                .lock()
                .values()
                .filter(|p| p.pool_id == pool_id)
                .cloned()
                .collect())
        })
    }
}
