//! Agent Runner - supervised execution of worker tasks
//!
//! This crate probes the guest runtimes available on the host and runs
//! task bundles under one of three supervisors: interpreted scripts
//! (python, node), shell commands, or containers.

mod command;
mod container;
mod error;
mod executor;
mod probe;
mod process;
mod result_file;
mod runtime;
mod script;
mod shell;
mod streaming;
mod venv;

pub use container::ContainerSupervisor;
pub use error::{ExecutorError, Result};
pub use executor::{ExecutorConfig, TaskExecutor};
pub use probe::{ProbeTarget, RuntimeCapabilityProbe};
pub use process::{ProcessOutcome, ProcessSpec, TimeoutAction};
pub use result_file::{StructuredResult, RESULT_FILE};
pub use runtime::{ExecutionPlan, ScriptLanguage};
pub use script::{ScriptSupervisor, DEFAULT_SUCCESS_OUTPUT};
pub use shell::ShellSupervisor;
pub use streaming::{ChunkSender, OutputStreamer, StreamerHandle};
