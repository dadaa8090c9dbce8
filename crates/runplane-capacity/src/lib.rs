//! runplane-capacity — pod and slot bookkeeping for elastic agent pools.
//!
//! A pool is a set of pods; every pod exposes the pool's configured number
//! of slots, and each slot is idle, reserved or running.
//!
//! ```text
//!            CapacityPool
//!   RwLock<HashMap<pod name, Arc<ManagedPod>>>
//!        │
//!        ├── ManagedPod { Mutex<PodState> }   ◄── per-pod allocation lock
//!        │      └── slots: [Idle | Reserved(task) | Running(task)]
//!        │
//!        └── PodBackend (create / delete / list)  ◄── cluster API
//! ```
//!
//! The map lock is only held to look pods up; slot state is only changed
//! under the owning pod's lock, so allocation on one pod never waits on
//! another. Backend calls happen outside both locks and are bounded by a
//! timeout.

pub mod backend;
pub mod error;
pub mod pool;
pub mod slot;

pub use backend::{BoxFuture, InMemoryPodBackend, ObservedPod, PodBackend, PodPhase};
pub use error::{CapacityError, CapacityResult};
pub use pool::{CapacityConfig, CapacityPool};
pub use slot::{PodSnapshot, Slot, SlotAssignment, SlotStats, SlotStatus};
