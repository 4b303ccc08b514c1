//! Worker agent
//!
//! Registers with the control plane, then polls for tasks and runs them one
//! at a time until a shutdown signal arrives.

pub mod agent;
pub mod shutdown;

pub use agent::{AgentError, AgentState, WorkerAgent};
pub use shutdown::{install_shutdown_handler, FORCED_EXIT_CODE};
