//! Control-plane client
//!
//! The `ControlPlane` trait is the seam between the agent loop and the
//! remote coordinator; `ControlPlaneClient` is its HTTP implementation.

mod http;
mod protocol;

use async_trait::async_trait;

use crate::capabilities::WorkerCapabilities;
use crate::task::{ExecutionResult, Task};
use crate::Result;

pub use http::{ControlPlaneClient, MAX_REPORTED_OUTPUT_CHARS};
pub use protocol::{Heartbeat, OutputChunk, OutputStream, WorkerStatus};

/// Destination for batches of streamed task output
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn send_output(&self, task_id: &str, chunks: &[OutputChunk]) -> Result<()>;
}

/// Everything the worker agent asks of the control plane
#[async_trait]
pub trait ControlPlane: OutputSink {
    /// Register this worker; returns the worker id assigned by the control plane
    async fn register(&self, capabilities: &WorkerCapabilities) -> Result<String>;

    async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<()>;

    /// Fetch the next task, if any is waiting
    async fn next_task(&self, worker_id: &str) -> Result<Option<Task>>;

    async fn complete_task(
        &self,
        task_id: &str,
        worker_id: &str,
        result: &ExecutionResult,
    ) -> Result<()>;

    async fn fail_task(&self, task_id: &str, worker_id: &str, error_message: &str) -> Result<()>;
}
