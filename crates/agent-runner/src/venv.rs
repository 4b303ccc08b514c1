//! Per-task Python virtual environments
//!
//! Built when a bundle ships a `requirements.txt`. Every failure here
//! degrades to the system interpreter instead of failing the task.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use agent_core::client::OutputChunk;

use crate::command::run_bounded_checked;
use crate::streaming::ChunkSender;

pub const VENV_DIR: &str = ".venv";
pub const REQUIREMENTS_FILE: &str = "requirements.txt";

const CREATE_TIMEOUT: Duration = Duration::from_secs(30);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(180);

/// Whether the bundle declares at least one requirement
pub async fn has_requirements(workdir: &Path) -> bool {
    match tokio::fs::read_to_string(workdir.join(REQUIREMENTS_FILE)).await {
        Ok(contents) => contents
            .lines()
            .map(str::trim)
            .any(|line| !line.is_empty() && !line.starts_with('#')),
        Err(_) => false,
    }
}

/// A created virtual environment inside a task's working directory
#[derive(Debug)]
pub struct Venv {
    dir: PathBuf,
    bin_dir: PathBuf,
    python: PathBuf,
}

impl Venv {
    /// Create the environment and install requirements into it
    ///
    /// Returns `None` when the environment could not be created; an install
    /// failure still returns the environment and is reported on `chunks`.
    pub async fn prepare(workdir: &Path, system_python: &str, chunks: &ChunkSender) -> Option<Self> {
        let dir = workdir.join(VENV_DIR);
        info!("Creating virtual environment in {:?}", dir);

        if let Err(e) = run_bounded_checked(
            system_python,
            &["-m", "venv", VENV_DIR],
            Some(workdir),
            &[],
            CREATE_TIMEOUT,
        )
        .await
        {
            warn!("Virtual environment creation failed, using system interpreter: {}", e);
            remove_dir(&dir).await;
            return None;
        }

        let bin_dir = dir.join(if cfg!(windows) { "Scripts" } else { "bin" });
        let exe = |name: &str| bin_dir.join(if cfg!(windows) { format!("{}.exe", name) } else { name.to_string() });
        let python = exe("python");
        let pip = exe("pip");

        if !tokio::fs::try_exists(&python).await.unwrap_or(false) {
            warn!("No interpreter at {:?}, using system interpreter", python);
            remove_dir(&dir).await;
            return None;
        }

        let venv = Self {
            dir,
            bin_dir,
            python,
        };

        info!("Installing {} into {:?}", REQUIREMENTS_FILE, venv.dir);
        match run_bounded_checked(
            &pip,
            &["install", "-r", REQUIREMENTS_FILE],
            Some(workdir),
            &venv.env(),
            INSTALL_TIMEOUT,
        )
        .await
        {
            Ok(_) => debug!("Requirements installed"),
            Err(e) => {
                warn!("Requirement installation failed, continuing: {}", e);
                let _ = chunks.send(OutputChunk::stderr(format!(
                    "[agent] Failed to install {}: {}\n",
                    REQUIREMENTS_FILE, e
                )));
            }
        }

        Some(venv)
    }

    pub fn python(&self) -> &Path {
        &self.python
    }

    /// `VIRTUAL_ENV` plus a `PATH` with the environment's bin dir in front
    pub fn env(&self) -> Vec<(String, String)> {
        let mut paths = vec![self.bin_dir.clone()];
        if let Some(existing) = std::env::var_os("PATH") {
            paths.extend(std::env::split_paths(&existing));
        }
        let path = std::env::join_paths(paths)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| self.bin_dir.to_string_lossy().into_owned());

        vec![
            ("VIRTUAL_ENV".to_string(), self.dir.to_string_lossy().into_owned()),
            ("PATH".to_string(), path),
        ]
    }

    /// Delete the environment; failures are only logged
    pub async fn remove(self) {
        remove_dir(&self.dir).await;
    }
}

async fn remove_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!("Removed {:?}", dir),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {:?}: {}", dir, e),
    }
}
