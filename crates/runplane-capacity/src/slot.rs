//! Slot and pod value types.

use std::fmt;

use serde::Serialize;

use runplane_state::{AgentId, PoolId, TaskId, TaskKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Idle,
    Reserved,
    Running,
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SlotStatus::Idle => "idle",
            SlotStatus::Reserved => "reserved",
            SlotStatus::Running => "running",
        })
    }
}

/// One unit of capacity within a pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub index: usize,
    pub status: SlotStatus,
    pub task_id: Option<TaskId>,
    pub task_kind: Option<TaskKind>,
    /// Unix timestamp (seconds) of the last status change.
    pub updated_at: u64,
}

impl Slot {
    pub(crate) fn idle(index: usize, now: u64) -> Self {
        Self {
            index,
            status: SlotStatus::Idle,
            task_id: None,
            task_kind: None,
            updated_at: now,
        }
    }

    pub(crate) fn bind(&mut self, status: SlotStatus, task_id: TaskId, kind: TaskKind, now: u64) {
        self.status = status;
        self.task_id = Some(task_id);
        self.task_kind = Some(kind);
        self.updated_at = now;
    }

    pub(crate) fn clear(&mut self, now: u64) {
        *self = Slot::idle(self.index, now);
    }

    pub fn is_idle(&self) -> bool {
        self.status == SlotStatus::Idle
    }

    /// Holds or is about to hold a PlanAndApply task.
    pub(crate) fn holds_apply(&self) -> bool {
        !self.is_idle() && self.task_kind == Some(TaskKind::PlanAndApply)
    }
}

/// Point-in-time copy of a pod's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PodSnapshot {
    pub name: String,
    pub pool_id: PoolId,
    pub agent_id: Option<AgentId>,
    pub created_at: u64,
    pub last_heartbeat: u64,
    pub slots: Vec<Slot>,
}

impl PodSnapshot {
    pub fn is_fully_idle(&self) -> bool {
        self.slots.iter().all(Slot::is_idle)
    }

    pub fn has_running(&self) -> bool {
        self.slots.iter().any(|s| s.status == SlotStatus::Running)
    }
}

/// Where a task was placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAssignment {
    pub pod_name: String,
    pub slot: usize,
    /// Agent registered on the pod, if any has registered yet.
    pub agent_id: Option<AgentId>,
}

/// Aggregate slot counts for a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SlotStats {
    pub total: u32,
    pub used: u32,
    pub reserved: u32,
    pub idle: u32,
}

impl SlotStats {
    /// Fraction of slots that are running or reserved.
    pub fn utilization(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        f64::from(self.used + self.reserved) / f64::from(self.total)
    }
}
