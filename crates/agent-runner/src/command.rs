//! Short-lived helper commands with a hard deadline
//!
//! Used for runtime probes and virtual-environment setup, where the whole
//! output is small and only needed once the command has finished.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::{ExecutorError, Result};

/// Output from a bounded command
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl CommandOutput {
    /// First non-empty line of stdout, falling back to stderr
    pub fn first_line(&self) -> Option<&str> {
        self.stdout
            .lines()
            .chain(self.stderr.lines())
            .map(str::trim)
            .find(|line| !line.is_empty())
    }
}

/// Run `program args...` and collect its output, killing it at `timeout`
pub async fn run_bounded<S: AsRef<OsStr>>(
    program: impl AsRef<OsStr>,
    args: &[S],
    cwd: Option<&Path>,
    envs: &[(String, String)],
    timeout: Duration,
) -> Result<CommandOutput> {
    let program = program.as_ref();
    debug!("Running {:?} (timeout {:?})", program, timeout);

    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }

    let child = cmd.spawn().map_err(|e| {
        ExecutorError::spawn_failed_with_source(format!("{:?}: {}", program, e), e)
    })?;

    // Dropping the future on timeout drops the child, which kills it
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| ExecutorError::Timeout {
            seconds: timeout.as_secs(),
        })??;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    trace!("{:?} stdout: {}", program, stdout);
    if !stderr.is_empty() {
        trace!("{:?} stderr: {}", program, stderr);
    }

    Ok(CommandOutput {
        stdout,
        stderr,
        success: output.status.success(),
    })
}

/// Run a bounded command and return an error if it fails
pub async fn run_bounded_checked<S: AsRef<OsStr>>(
    program: impl AsRef<OsStr>,
    args: &[S],
    cwd: Option<&Path>,
    envs: &[(String, String)],
    timeout: Duration,
) -> Result<CommandOutput> {
    let program = program.as_ref();
    let output = run_bounded(program, args, cwd, envs, timeout).await?;

    if !output.success {
        let detail = match output.stderr.trim() {
            "" => output.stdout.trim(),
            stderr => stderr,
        };
        return Err(ExecutorError::execution_failed(format!(
            "{:?} failed: {}",
            program, detail
        )));
    }

    Ok(output)
}
