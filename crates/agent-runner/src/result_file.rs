//! Structured result file written by task scripts

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

/// File name looked up in the working directory after the script exits
pub const RESULT_FILE: &str = "result.json";

/// Contents of `result.json`; every field is optional
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StructuredResult {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl StructuredResult {
    /// Read the result file; a missing or unreadable file is treated as absent
    pub async fn load(dir: &Path) -> Option<Self> {
        let path = dir.join(RESULT_FILE);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read {:?}: {}", path, e);
                return None;
            }
        };

        match serde_json::from_str::<Self>(&raw) {
            Ok(parsed) => {
                debug!("Loaded structured result from {:?}", path);
                Some(parsed)
            }
            Err(e) => {
                warn!("Ignoring malformed {:?}: {}", path, e);
                None
            }
        }
    }

    /// Reported output on success: `result`, else `output`
    pub fn success_output(&self) -> Option<String> {
        render(self.result.as_ref()).or_else(|| render(self.output.as_ref()))
    }

    pub fn error_message(&self) -> Option<String> {
        render(self.error.as_ref())
    }
}

/// Strings as they are, anything else as compact JSON; null counts as absent
fn render(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
