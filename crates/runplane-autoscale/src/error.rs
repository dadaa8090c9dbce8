//! Error types for the Runplane autoscaler.

use thiserror::Error;

use runplane_capacity::CapacityError;
use runplane_state::StateError;

/// Result type alias for autoscaler operations.
pub type ScaleResult<T> = Result<T, ScaleError>;

#[derive(Debug, Error)]
pub enum ScaleError {
    #[error("pool {0} not found")]
    PoolNotFound(String),

    #[error("clock reading {0} is out of range")]
    ClockOutOfRange(u64),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Capacity(#[from] CapacityError),
}
