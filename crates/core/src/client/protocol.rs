//! Wire types of the control-plane HTTP contract

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::Task;

/// Status reported in heartbeats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Online,
    Busy,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub mac_address: String,
    /// MiB
    pub ram_available: u64,
    pub status: WorkerStatus,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RegisterResponse {
    #[serde(default, alias = "worker_id")]
    pub worker_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct NextTaskResponse {
    #[serde(default)]
    pub task: Option<Task>,
}

/// Which child stream a chunk was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// One piece of captured process output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    #[serde(rename = "type")]
    pub stream: OutputStream,
    pub data: String,
    pub timestamp: DateTime<Utc>,
}

impl OutputChunk {
    pub fn new(stream: OutputStream, data: impl Into<String>) -> Self {
        Self {
            stream,
            data: data.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn stdout(data: impl Into<String>) -> Self {
        Self::new(OutputStream::Stdout, data)
    }

    pub fn stderr(data: impl Into<String>) -> Self {
        Self::new(OutputStream::Stderr, data)
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct OutputRequest<'a> {
    pub output: &'a [OutputChunk],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CompleteRequest<'a> {
    pub worker_id: &'a str,
    pub execution_time: u64,
    pub output: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FailRequest<'a> {
    pub worker_id: &'a str,
    pub error_message: &'a str,
}
