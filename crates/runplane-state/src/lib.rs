//! runplane-state — embedded state store for Runplane.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for tasks, workspaces, and agent pools.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Task keys are zero-padded numeric IDs, so a table scan visits tasks in
//! creation order; the scheduler's "oldest pending" queries rely on this.
//!
//! ```text
//!   Dispatcher ──┐
//!   Autoscaler ──┼──► StateStore (Arc<Database>) ──► tasks / workspaces / pools / meta
//!   Recovery ────┘
//! ```
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. redb serializes write transactions,
//! which is what gives [`StateStore::claim_task`] its skip-locked behavior.

pub mod clock;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{StateError, StateResult};
pub use store::{Claim, StateStore};
pub use types::*;
