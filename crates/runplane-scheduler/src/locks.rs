//! Per-workspace mutual exclusion for mutating tasks.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lazily created, never evicted: a cached entry is just an unlocked mutex.
#[derive(Debug, Default)]
pub struct WorkspaceLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WorkspaceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, workspace_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(workspace_id.to_string())
            .or_default()
            .clone()
    }

    /// Wait for the workspace's lock. Held until the guard is dropped.
    pub async fn lock(&self, workspace_id: &str) -> OwnedMutexGuard<()> {
        self.entry(workspace_id).await.lock_owned().await
    }

}

#[cfg(test)]
impl WorkspaceLocks {
    async fn try_lock(&self, workspace_id: &str) -> Option<OwnedMutexGuard<()>> {
        self.entry(workspace_id).await.try_lock_owned().ok()
    }

    async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_workspace_excludes() {
        let locks = WorkspaceLocks::new();
        let guard = locks.lock("ws-1").await;
        assert!(locks.try_lock("ws-1").await.is_none());
        assert!(locks.try_lock("ws-2").await.is_some());
        drop(guard);
        assert!(locks.try_lock("ws-1").await.is_some());
        assert_eq!(locks.len().await, 2);
    }

    #[tokio::test]
    async fn waiter_proceeds_after_release() {
        let locks = Arc::new(WorkspaceLocks::new());
        let guard = locks.lock("ws-1").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock("ws-1").await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }
}
