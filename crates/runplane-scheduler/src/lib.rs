//! runplane-scheduler — deciding what runs next and getting it there.
//!
//! ```text
//!   trigger / retry ──► DispatchQueue ──► worker ──► Dispatcher::try_dispatch
//!                        (deadlines)                    │
//!                                                       ├── selector (Pending order)
//!                                                       ├── WorkspaceLocks (PlanAndApply)
//!                                                       ├── CapacityPool (Kubernetes slots)
//!                                                       └── AgentChannel / ExecutionEngine
//! ```
//!
//! Transient failures never surface as errors: the workspace goes back on
//! the queue with a delay from [`BackoffPolicy`].

pub mod backoff;
pub mod collaborators;
pub mod dispatcher;
pub mod error;
pub mod locks;
pub mod queue;
pub mod recovery;
pub mod selector;

pub use backoff::BackoffPolicy;
pub use collaborators::{
    AgentAction, AgentChannel, CompletionHooks, ConnectedAgent, ExecutionEngine, NoopHooks,
    ScaleUpCallback,
};
pub use dispatcher::{DispatchConfig, DispatchOutcome, Dispatcher, RetryReason};
pub use error::{DispatchError, DispatchResult};
pub use locks::WorkspaceLocks;
pub use queue::{DispatchQueue, RetryQueue, WorkspaceHandler};
pub use recovery::{
    RecoveryReport, cancel_run_trigger_tasks, cleanup_orphan_tasks, recover_pending_tasks,
    run_sweeper, sweep_pending,
};
pub use selector::next_executable_task;
