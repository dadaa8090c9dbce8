use thiserror::Error;

use runplane_state::{StateError, TaskId};

use crate::slot::SlotStatus;

pub type CapacityResult<T> = Result<T, CapacityError>;

#[derive(Debug, Error)]
pub enum CapacityError {
    #[error("pod {0} not found")]
    PodNotFound(String),

    #[error("pod {pod}: invalid slot {slot}")]
    InvalidSlot { pod: String, slot: usize },

    #[error("pod {pod}: slot {slot} is not idle (status: {status})")]
    SlotBusy {
        pod: String,
        slot: usize,
        status: SlotStatus,
    },

    #[error("no free slot available in pool {0}")]
    NoFreeSlot(String),

    #[error("task {0} is not bound to any slot")]
    TaskNotPlaced(TaskId),

    #[error("pod {0} has non-idle slots")]
    PodBusy(String),

    #[error("pod backend error: {0}")]
    Backend(String),

    #[error("pod backend timed out during {0}")]
    Timeout(&'static str),

    #[error(transparent)]
    State(#[from] StateError),
}
