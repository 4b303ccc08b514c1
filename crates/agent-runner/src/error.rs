//! Error types for agent-runner

use std::path::PathBuf;
use thiserror::Error;

use agent_core::client::OutputStream;

/// Result type alias for executor operations
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Errors that can occur during task execution
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Bundle could not be materialized
    #[error("Failed to prepare task bundle: {0}")]
    Materialization(#[from] task_bundle::BundleError),

    /// Task execution config could not be parsed
    #[error("Invalid execution config: {message}")]
    InvalidConfig { message: String },

    /// Runtime name not recognized
    #[error("Unsupported runtime: {runtime}")]
    UnknownRuntime { runtime: String },

    /// Runtime recognized but not installed on this worker
    #[error("Runtime {runtime} is not available on this worker")]
    RuntimeUnavailable { runtime: String },

    /// Container engine missing
    #[error("Docker is not available on this worker")]
    ContainerUnavailable,

    /// No entry-point script in the working directory
    #[error("No {extension} script found in {dir}; contents: [{contents}]")]
    ScriptNotFound {
        extension: &'static str,
        dir: PathBuf,
        contents: String,
    },

    /// Failed to spawn a process
    #[error("Failed to spawn process: {message}")]
    SpawnFailed {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Process exited unsuccessfully; the message is what gets reported
    #[error("{message}")]
    ProcessExited { code: Option<i32>, message: String },

    /// Execution timeout
    #[error("Execution timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    /// Captured output exceeded the configured cap
    #[error("{} output exceeded {limit} bytes", stream.as_str())]
    OutputOverflow { stream: OutputStream, limit: usize },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Execution failed
    #[error("Execution failed: {message}")]
    ExecutionFailed { message: String },
}

impl ExecutorError {
    /// Create a SpawnFailed error
    pub fn spawn_failed(message: impl Into<String>) -> Self {
        Self::SpawnFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a SpawnFailed error with source
    pub fn spawn_failed_with_source(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::SpawnFailed {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create an ExecutionFailed error
    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
        }
    }

    /// Nonzero exit reported with the generic message
    pub fn exited(code: Option<i32>) -> Self {
        Self::ProcessExited {
            code,
            message: match code {
                Some(code) => format!("Process exited with code {}", code),
                None => "Process terminated by signal".to_string(),
            },
        }
    }
}
