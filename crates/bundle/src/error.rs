//! Error types for bundle materialization

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for bundle operations
pub type Result<T> = std::result::Result<T, BundleError>;

/// Reasons a task's executable content could not be materialized
#[derive(Debug, Error)]
pub enum BundleError {
    /// The inline payload is not valid base64
    #[error("Failed to decode inline bundle: {0}")]
    Decode(#[from] base64::DecodeError),

    /// Transport failure or timeout while downloading
    #[error("Failed to download bundle from {url}: {message}")]
    Download { url: String, message: String },

    /// The download answered with a non-2xx status
    #[error("Bundle download from {url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    /// Archive could not be read or unpacked
    #[error("Failed to extract bundle: {message}")]
    Extract { message: String },

    /// No payload, no URL and no inline command
    #[error("Task {task_id} has no executable content (no code bundle, URL or command)")]
    NoExecutableContent { task_id: String },

    /// Task id cannot be used as a directory name
    #[error("Invalid task id for working directory: {task_id:?}")]
    InvalidTaskId { task_id: String },

    /// Failed to prepare the working directory
    #[error("Failed to prepare working directory {path}: {source}")]
    Workdir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BundleError {
    /// Create an Extract error
    pub fn extract(message: impl Into<String>) -> Self {
        Self::Extract {
            message: message.into(),
        }
    }

    /// Create a Download error
    pub fn download(url: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Download {
            url: url.into(),
            message: message.to_string(),
        }
    }
}
