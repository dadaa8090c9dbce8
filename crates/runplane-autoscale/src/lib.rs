//! runplane-autoscale — slot-driven pod scaling for Kubernetes pools.
//!
//! Each cycle reconciles a pool's pods against the backend, restarts pods
//! whose agent never registered, and moves the pod count toward the
//! desired value.
//!
//! # Scaling Algorithm
//!
//! ```text
//! frozen (and no one-time unfreeze):
//!     delete every fully idle pod, create nothing
//!
//! no pods / no slots:
//!     desired = min_replicas, at least 1 when anything is Pending
//!
//! unblocked PlanAndApply waiting:
//!     desired = pods_with_running + unblocked_pending_apply   (if > current)
//! else utilization > 0.8:
//!     desired = current + 1
//! else utilization < 0.2 and nothing running and nothing unblocked:
//!     desired = current - 1
//!
//! desired = max(desired, ceil(reserved / slots_per_pod))
//! desired = clamp(desired, min_replicas, max_replicas)
//! ```
//!
//! Scale-down only ever removes fully idle pods and is skipped entirely
//! while any task awaits apply confirmation.

pub mod error;
pub mod freeze;
pub mod restart;
pub mod scaler;

pub use error::{ScaleError, ScaleResult};
pub use freeze::{FreezeStatus, freeze_window, freeze_window_with_unfreeze, pool_freeze_status};
pub use restart::{RestartDecision, RestartInfo, RestartPolicy, RestartTracker};
pub use scaler::{AutoscaleConfig, Autoscaler, CapacitySnapshot, desired_pods};
