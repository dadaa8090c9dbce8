//! runplaned — the Runplane daemon.
//!
//! Assembles the Runplane subsystems in one process:
//! - State store (redb)
//! - Capacity pool + pod backend
//! - Dispatch queue, dispatcher and connected-agent registry
//! - Pending-task sweep
//! - Autoscaler

pub mod agent_registry;
pub mod config;
pub mod engine;
pub mod orchestrator;

pub use agent_registry::{AgentMessage, AgentRegistry, AgentStatus};
pub use config::RunplaneConfig;
pub use engine::{CommandEngine, CommandSpec, LocalExecution};
pub use orchestrator::Orchestrator;
