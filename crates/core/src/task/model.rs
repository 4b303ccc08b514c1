//! Task model definitions

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::Error;
use crate::task::ExecutionConfig;
use crate::Result;

/// A unit of work received from the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,
    #[serde(default)]
    pub is_docker: bool,
    /// Either a structured object or a JSON-encoded string
    #[serde(default)]
    pub execution_config: serde_json::Value,
    /// Inline base64-encoded archive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_base64: Option<String>,
    /// Archive download location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_url: Option<String>,
}

/// Where a task's executable content comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeSource<'a> {
    Inline(&'a str),
    Remote(&'a str),
    None,
}

impl Task {
    /// Create a task with no code reference and an empty config
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            runtime: None,
            docker_image: None,
            is_docker: false,
            execution_config: serde_json::Value::Null,
            code_base64: None,
            code_url: None,
        }
    }

    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = Some(runtime.into());
        self
    }

    pub fn with_docker_image(mut self, image: impl Into<String>) -> Self {
        self.docker_image = Some(image.into());
        self
    }

    pub fn with_code_base64(mut self, payload: impl Into<String>) -> Self {
        self.code_base64 = Some(payload.into());
        self
    }

    pub fn with_code_url(mut self, url: impl Into<String>) -> Self {
        self.code_url = Some(url.into());
        self
    }

    pub fn with_execution_config(mut self, config: serde_json::Value) -> Self {
        self.execution_config = config;
        self
    }

    /// Resolve the code reference; an inline payload wins over a URL and
    /// blank strings count as absent.
    pub fn code_source(&self) -> CodeSource<'_> {
        fn present(v: &Option<String>) -> Option<&str> {
            v.as_deref().filter(|s| !s.trim().is_empty())
        }

        if let Some(payload) = present(&self.code_base64) {
            CodeSource::Inline(payload)
        } else if let Some(url) = present(&self.code_url) {
            CodeSource::Remote(url)
        } else {
            CodeSource::None
        }
    }

    /// Parse the execution configuration carried by this task
    pub fn parse_config(&self) -> Result<ExecutionConfig> {
        ExecutionConfig::parse(&self.execution_config)
            .map_err(|e| Error::InvalidInput(format!("task {}: {}", self.id, e)))
    }
}

/// Outcome of one supervised execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub output: String,
    /// Wall-clock seconds, rounded down
    pub execution_time: u64,
    pub success: bool,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>, execution_time: u64) -> Self {
        Self {
            output: output.into(),
            execution_time,
            success: true,
        }
    }
}

fn de_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "task id must be a string or number, got {}",
            other
        ))),
    }
}
