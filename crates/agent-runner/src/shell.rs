//! Shell-command supervisor

use std::path::Path;
use std::time::Duration;

use tracing::info;

use agent_core::task::ExecutionConfig;

use crate::error::Result;
use crate::process::{self, ProcessSpec, TimeoutAction};
use crate::script::interpret;

pub const DEFAULT_SHELL_TIMEOUT: Duration = Duration::from_secs(300);
/// Per-stream capture cap
pub const DEFAULT_OUTPUT_LIMIT: usize = 10 * 1024 * 1024;

const FALLBACK_COMMAND: &str = "echo \"No command specified\"";

/// Runs the config's inline command through the platform shell
#[derive(Debug, Clone)]
pub struct ShellSupervisor {
    default_timeout: Duration,
    output_limit: usize,
}

impl Default for ShellSupervisor {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_SHELL_TIMEOUT,
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }
}

impl ShellSupervisor {
    pub fn new(default_timeout: Duration, output_limit: usize) -> Self {
        Self {
            default_timeout,
            output_limit,
        }
    }

    /// Run the command to completion; output is captured, not streamed
    pub async fn run(&self, workdir: &Path, config: &ExecutionConfig) -> Result<String> {
        let command = config.command().unwrap_or(FALLBACK_COMMAND);
        info!("Running shell command in {:?}: {}", workdir, command);

        let spec = shell_spec(command, workdir)
            .envs(config.environment.clone())
            .timeout(
                Some(config.timeout().unwrap_or(self.default_timeout)),
                TimeoutAction::Kill,
            )
            .output_limit(self.output_limit);

        let outcome = process::run(spec, None).await?;
        interpret(outcome, None)
    }
}

fn shell_spec(command: &str, workdir: &Path) -> ProcessSpec {
    if cfg!(windows) {
        ProcessSpec::new("cmd", workdir).arg("/C").arg(command)
    } else {
        ProcessSpec::new("sh", workdir).arg("-c").arg(command)
    }
}
