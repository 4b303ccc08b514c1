//! Per-task working directory management

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{BundleError, Result};

/// Owns the root under which every task gets `<root>/<task id>`
#[derive(Debug, Clone)]
pub struct WorkdirManager {
    root: PathBuf,
}

impl WorkdirManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root if it does not exist yet
    pub async fn ensure_root(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| BundleError::Workdir {
                path: self.root.clone(),
                source,
            })
    }

    /// Directory for a task, without touching the filesystem
    pub fn path_for(&self, task_id: &str) -> Result<PathBuf> {
        let name = dir_name(task_id).ok_or_else(|| BundleError::InvalidTaskId {
            task_id: task_id.to_string(),
        })?;
        Ok(self.root.join(name))
    }

    /// Give a task a fresh, empty directory
    ///
    /// Anything left from an earlier attempt with the same id is removed first.
    pub async fn reset(&self, task_id: &str) -> Result<PathBuf> {
        let path = self.path_for(task_id)?;
        let to_workdir_err = |source| BundleError::Workdir {
            path: path.clone(),
            source,
        };

        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => info!("Removed leftover working directory {:?}", path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(to_workdir_err(e)),
        }

        tokio::fs::create_dir_all(&path).await.map_err(to_workdir_err)?;
        // Children run with this as cwd, so hand out an absolute path
        let path = tokio::fs::canonicalize(&path).await.map_err(to_workdir_err)?;
        debug!("Prepared working directory {:?}", path);
        Ok(path)
    }
}

/// Map a task id onto a single safe path component
fn dir_name(task_id: &str) -> Option<String> {
    let name: String = task_id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if name.is_empty() || name.chars().all(|c| c == '.') {
        None
    } else {
        Some(name)
    }
}
