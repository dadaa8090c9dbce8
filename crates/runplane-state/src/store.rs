//! StateStore — redb-backed state persistence for Runplane.
//!
//! Provides typed CRUD operations over tasks, workspaces and agent pools,
//! plus the handful of queries the scheduler and autoscaler need. All
//! values are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Result of [`StateStore::claim_task`].
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// The row is now Running and leased to the caller.
    Claimed(Task),
    /// The row is no longer in the expected status.
    Moved { status: TaskStatus },
    /// Another holder has a live lease on the row.
    Leased { holder: String },
    /// The workspace is under an administrative lock.
    WorkspaceLocked,
    /// An earlier PlanAndApply of the workspace is still active.
    Blocked { by: TaskId },
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(TASKS).map_err(map_err!(Table))?;
        txn.open_table(WORKSPACES).map_err(map_err!(Table))?;
        txn.open_table(POOLS).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON rows ──────────────────────────────────────────

    fn put_row<T: Serialize>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        key: &str,
        row: &T,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(row).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            table.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_row<T: DeserializeOwned>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let row: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    /// Scan a table in key order, keeping rows accepted by `keep`.
    fn scan_rows<T: DeserializeOwned>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        mut keep: impl FnMut(&T) -> bool,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let row: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if keep(&row) {
                results.push(row);
            }
        }
        Ok(results)
    }

    fn delete_row(&self, table_def: TableDefinition<&str, &[u8]>, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Persist a new task, assigning the next ID from the sequence.
    pub fn create_task(&self, mut task: Task) -> StateResult<Task> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            let last = meta
                .get(TASK_SEQ)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0);
            task.id = last + 1;
            meta.insert(TASK_SEQ, task.id).map_err(map_err!(Write))?;

            let key = task.table_key();
            let value = serde_json::to_vec(&task).map_err(map_err!(Serialize))?;
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(task_id = task.id, workspace_id = %task.workspace_id, kind = %task.kind, "task created");
        Ok(task)
    }

    /// Insert or overwrite a task as-is.
    pub fn put_task(&self, task: &Task) -> StateResult<()> {
        self.put_row(TASKS, &task.table_key(), task)
    }

    pub fn get_task(&self, id: TaskId) -> StateResult<Option<Task>> {
        self.get_row(TASKS, &task_key(id))
    }

    /// All tasks in ID order.
    pub fn list_tasks(&self) -> StateResult<Vec<Task>> {
        self.scan_rows(TASKS, |_: &Task| true)
    }

    pub fn list_tasks_for_workspace(&self, workspace_id: &str) -> StateResult<Vec<Task>> {
        self.scan_rows(TASKS, |t: &Task| t.workspace_id == workspace_id)
    }

    pub fn list_tasks_by_status(&self, status: TaskStatus) -> StateResult<Vec<Task>> {
        self.scan_rows(TASKS, |t: &Task| t.status == status)
    }

    /// Read-modify-write a task inside one write transaction.
    ///
    /// If `f` fails the transaction is dropped and nothing is written.
    pub fn update_task<F>(&self, id: TaskId, f: F) -> StateResult<Task>
    where
        F: FnOnce(&mut Task) -> StateResult<()>,
    {
        let key = task_key(id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let task = {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let mut task: Task = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(format!("task {id}"))),
            };
            f(&mut task)?;
            let value = serde_json::to_vec(&task).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            task
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(task)
    }

    /// Record an operator's confirmation of the apply phase.
    ///
    /// This is the only writer of `apply_confirmed_by`/`apply_confirmed_at`.
    pub fn confirm_apply(&self, id: TaskId, user: &str, now: u64) -> StateResult<Task> {
        let task = self.update_task(id, |task| {
            if task.status != TaskStatus::ApplyPending {
                return Err(StateError::InvalidTransition {
                    task_id: task.id,
                    from: task.status,
                    to: TaskStatus::Running,
                });
            }
            task.apply_confirmed_by = Some(user.to_string());
            task.apply_confirmed_at = Some(now);
            Ok(())
        })?;
        info!(task_id = id, %user, "apply confirmed");
        Ok(task)
    }

    // ── Selector queries ───────────────────────────────────────────

    /// Oldest Pending task of `kind` in a workspace.
    pub fn oldest_pending(&self, workspace_id: &str, kind: TaskKind) -> StateResult<Option<Task>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let task: Task =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if task.workspace_id == workspace_id
                && task.kind == kind
                && task.status == TaskStatus::Pending
            {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    /// Whether an earlier PlanAndApply task of the workspace is still active.
    pub fn has_blocking_plan_and_apply(
        &self,
        workspace_id: &str,
        before_id: TaskId,
    ) -> StateResult<bool> {
        let blocking = self.scan_rows(TASKS, |t: &Task| {
            t.workspace_id == workspace_id
                && t.id < before_id
                && t.kind == TaskKind::PlanAndApply
                && t.status.is_active()
        })?;
        Ok(!blocking.is_empty())
    }

    /// Workspaces with at least one Pending task, in order of their oldest one.
    pub fn workspaces_with_pending(&self) -> StateResult<Vec<WorkspaceId>> {
        let pending = self.list_tasks_by_status(TaskStatus::Pending)?;
        let mut seen = HashSet::new();
        Ok(pending
            .into_iter()
            .filter(|t| seen.insert(t.workspace_id.clone()))
            .map(|t| t.workspace_id)
            .collect())
    }

    // ── Task leases ────────────────────────────────────────────────

    /// Move a task from `expected` to Running and stamp a lease for `holder`.
    ///
    /// Everything is re-checked inside one write transaction: the row's
    /// status, a live lease held by someone else, the workspace's
    /// administrative lock and, for a Pending PlanAndApply, any earlier
    /// PlanAndApply of the workspace that is still active. redb serializes
    /// writers, so a row claimed here is skipped by every other caller
    /// until the lease is released or expires. `apply` runs on the task
    /// after the transition, before it is written.
    pub fn claim_task<F>(
        &self,
        id: TaskId,
        expected: TaskStatus,
        holder: &str,
        lease_secs: u64,
        now: u64,
        apply: F,
    ) -> StateResult<Claim>
    where
        F: FnOnce(&mut Task),
    {
        let key = task_key(id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let task = {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let mut task: Task = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(format!("task {id}"))),
            };

            if task.status != expected {
                return Ok(Claim::Moved { status: task.status });
            }
            if let Some(lease) = &task.lease
                && lease.expires_at > now
                && lease.holder != holder
            {
                return Ok(Claim::Leased {
                    holder: lease.holder.clone(),
                });
            }

            let workspaces = txn.open_table(WORKSPACES).map_err(map_err!(Table))?;
            let workspace: Workspace =
                match workspaces.get(task.workspace_id.as_str()).map_err(map_err!(Read))? {
                    Some(guard) => {
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                    }
                    None => {
                        return Err(StateError::NotFound(format!(
                            "workspace {}",
                            task.workspace_id
                        )));
                    }
                };
            if workspace.is_locked {
                return Ok(Claim::WorkspaceLocked);
            }

            if task.kind == TaskKind::PlanAndApply && expected == TaskStatus::Pending {
                for entry in table.iter().map_err(map_err!(Read))? {
                    let (_, value) = entry.map_err(map_err!(Read))?;
                    let other: Task =
                        serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                    if other.id >= id {
                        break;
                    }
                    if other.workspace_id == task.workspace_id
                        && other.kind == TaskKind::PlanAndApply
                        && other.status.is_active()
                    {
                        return Ok(Claim::Blocked { by: other.id });
                    }
                }
            }

            task.transition_to(TaskStatus::Running)?;
            task.lease = Some(TaskLease {
                holder: holder.to_string(),
                locked_at: now,
                expires_at: now + lease_secs,
            });
            apply(&mut task);
            let value = serde_json::to_vec(&task).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            task
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(task_id = id, %holder, "task claimed");
        Ok(Claim::Claimed(task))
    }

    /// Return Running tasks whose lease has expired to the status they were
    /// claimed from (ApplyPending for an apply, Pending otherwise).
    pub fn clean_expired_leases(&self, now: u64) -> StateResult<Vec<TaskId>> {
        let expired = self.scan_rows(TASKS, |t: &Task| {
            t.status == TaskStatus::Running
                && t.lease.as_ref().is_some_and(|l| l.expires_at <= now)
        })?;

        let mut reclaimed = Vec::new();
        for task in expired {
            self.update_task(task.id, |t| {
                if t.stage == Some(Stage::Applying) {
                    t.transition_to(TaskStatus::ApplyPending)?;
                    t.stage = Some(Stage::ApplyPending);
                } else {
                    t.transition_to(TaskStatus::Pending)?;
                    t.stage = None;
                }
                t.lease = None;
                t.agent_id = None;
                t.started_at = None;
                Ok(())
            })?;
            reclaimed.push(task.id);
        }
        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "expired task leases reclaimed");
        }
        Ok(reclaimed)
    }

    // ── Workspaces ─────────────────────────────────────────────────

    pub fn put_workspace(&self, workspace: &Workspace) -> StateResult<()> {
        self.put_row(WORKSPACES, &workspace.workspace_id, workspace)?;
        debug!(workspace_id = %workspace.workspace_id, "workspace stored");
        Ok(())
    }

    pub fn get_workspace(&self, workspace_id: &str) -> StateResult<Option<Workspace>> {
        self.get_row(WORKSPACES, workspace_id)
    }

    pub fn list_workspaces(&self) -> StateResult<Vec<Workspace>> {
        self.scan_rows(WORKSPACES, |_: &Workspace| true)
    }

    pub fn delete_workspace(&self, workspace_id: &str) -> StateResult<bool> {
        self.delete_row(WORKSPACES, workspace_id)
    }

    // ── Pools ──────────────────────────────────────────────────────

    pub fn put_pool(&self, pool: &AgentPool) -> StateResult<()> {
        self.put_row(POOLS, &pool.pool_id, pool)?;
        debug!(pool_id = %pool.pool_id, "pool stored");
        Ok(())
    }

    pub fn get_pool(&self, pool_id: &str) -> StateResult<Option<AgentPool>> {
        self.get_row(POOLS, pool_id)
    }

    pub fn list_pools(&self) -> StateResult<Vec<AgentPool>> {
        self.scan_rows(POOLS, |_: &AgentPool| true)
    }

    pub fn delete_pool(&self, pool_id: &str) -> StateResult<bool> {
        self.delete_row(POOLS, pool_id)
    }

    /// Summarize live work routed to a Kubernetes pool.
    pub fn pool_task_summary(&self, pool_id: &str) -> StateResult<PoolTaskSummary> {
        let members: HashSet<WorkspaceId> = self
            .scan_rows(WORKSPACES, |w: &Workspace| {
                w.execution_mode == ExecutionMode::Kubernetes
                    && w.current_pool_id.as_deref() == Some(pool_id)
            })?
            .into_iter()
            .map(|w| w.workspace_id)
            .collect();

        let mut summary = PoolTaskSummary::default();
        if members.is_empty() {
            return Ok(summary);
        }

        // Tasks arrive in ID order, so "an earlier task is active" is
        // exactly "the workspace is already in this set".
        let mut has_active: HashSet<WorkspaceId> = HashSet::new();
        for task in self.scan_rows(TASKS, |t: &Task| members.contains(&t.workspace_id))? {
            match task.status {
                TaskStatus::Running => summary.running += 1,
                TaskStatus::ApplyPending => {
                    summary.apply_pending += 1;
                    summary.apply_pending_task_ids.push(task.id);
                }
                TaskStatus::Pending => {
                    summary.pending += 1;
                    if !has_active.contains(&task.workspace_id) {
                        summary.unblocked_pending += 1;
                        if task.kind == TaskKind::PlanAndApply {
                            summary.unblocked_pending_apply += 1;
                        }
                    }
                    if !summary.pending_workspaces.contains(&task.workspace_id) {
                        summary.pending_workspaces.push(task.workspace_id.clone());
                    }
                }
                _ => {}
            }
            if task.status.is_active() {
                has_active.insert(task.workspace_id);
            }
        }
        Ok(summary)
    }
}
