//! Container supervisor
//!
//! Runs the task inside `docker run --rm` with the working directory mounted
//! at `/workspace`.

use std::ffi::OsString;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use agent_core::task::{ExecutionConfig, Task};

use crate::command::run_bounded_checked;
use crate::error::{ExecutorError, Result};
use crate::process::{self, ProcessSpec, TimeoutAction};
use crate::shell::DEFAULT_OUTPUT_LIMIT;

pub const CONTAINER_WORKDIR: &str = "/workspace";
const DEFAULT_IMAGE: &str = "alpine:latest";

/// Bound on `docker rm -f` after a timeout or overflow
const REMOVE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct ContainerSupervisor {
    docker: String,
    kill_grace: Duration,
    output_limit: usize,
}

impl ContainerSupervisor {
    /// `docker` is the probed engine executable
    pub fn new(docker: impl Into<String>, kill_grace: Duration) -> Self {
        Self {
            docker: docker.into(),
            kill_grace,
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    pub async fn run(&self, task: &Task, workdir: &Path, config: &ExecutionConfig) -> Result<String> {
        let image = image_for(task, config);
        let name = container_name(&task.id);
        let args = docker_args(&image, &name, workdir, config);
        info!("Running task {} in container {} ({})", task.id, name, image);

        let spec = ProcessSpec::new(&self.docker, workdir)
            .args(args)
            .timeout(
                config.timeout(),
                TimeoutAction::Terminate {
                    grace: self.kill_grace,
                },
            )
            .output_limit(self.output_limit);

        let outcome = match process::run(spec, None).await {
            Ok(outcome) => outcome,
            Err(e @ (ExecutorError::Timeout { .. } | ExecutorError::OutputOverflow { .. })) => {
                // Signals reach the CLI only; the daemon keeps the container
                self.remove(&name, workdir).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        if outcome.success() {
            return Ok(outcome.stdout.trim().to_string());
        }

        match outcome.stderr.trim() {
            "" => Err(ExecutorError::ProcessExited {
                code: outcome.code,
                message: match outcome.code {
                    Some(code) => format!("Container exited with code {}", code),
                    None => "Container terminated by signal".to_string(),
                },
            }),
            stderr => Err(ExecutorError::ProcessExited {
                code: outcome.code,
                message: stderr.to_string(),
            }),
        }
    }

    async fn remove(&self, name: &str, workdir: &Path) {
        info!("Removing container {}", name);
        if let Err(e) = run_bounded_checked(&self.docker, &["rm", "-f", name], Some(workdir), &[], REMOVE_TIMEOUT).await {
            warn!("Failed to remove container {}: {}", name, e);
        }
    }
}

/// Docker-safe name unique to this run of the task
fn container_name(task_id: &str) -> String {
    let id: String = task_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' { c } else { '-' })
        .collect();
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("worker-task-{}-{}", id, millis)
}

/// Image from the config, then the task, then a small default
fn image_for(task: &Task, config: &ExecutionConfig) -> String {
    config
        .docker_image()
        .or_else(|| task.docker_image.as_deref().map(str::trim).filter(|s| !s.is_empty()))
        .unwrap_or(DEFAULT_IMAGE)
        .to_string()
}

/// Arguments after `docker`
pub fn docker_args(image: &str, name: &str, workdir: &Path, config: &ExecutionConfig) -> Vec<OsString> {
    let mut mount = workdir.as_os_str().to_os_string();
    mount.push(":");
    mount.push(CONTAINER_WORKDIR);

    let mut args: Vec<OsString> = vec![
        "run".into(),
        "--rm".into(),
        "--name".into(),
        name.into(),
        "-v".into(),
        mount,
        "-w".into(),
        CONTAINER_WORKDIR.into(),
    ];

    for (key, value) in &config.environment {
        args.push("-e".into());
        args.push(format!("{}={}", key, value).into());
    }
    for (host, container) in &config.volumes {
        args.push("-v".into());
        args.push(format!("{}:{}", host, container).into());
    }
    for (host, container) in &config.ports {
        args.push("-p".into());
        args.push(format!("{}:{}", host, container).into());
    }

    args.push(image.into());

    if let Some(command) = config.docker_command() {
        args.extend(["sh".into(), "-c".into(), command.into()]);
    }
    args
}
