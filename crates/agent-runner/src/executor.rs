//! Task executor - materializes a task and hands it to the right supervisor

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info};

use agent_core::task::{ExecutionResult, Task};
use agent_core::{AgentConfig, OutputSink, RuntimeMap};
use task_bundle::{BundleMaterializer, WorkdirManager};

use crate::container::ContainerSupervisor;
use crate::error::{ExecutorError, Result};
use crate::runtime::{command_for, ExecutionPlan};
use crate::script::ScriptSupervisor;
use crate::shell::{ShellSupervisor, DEFAULT_OUTPUT_LIMIT, DEFAULT_SHELL_TIMEOUT};
use crate::streaming::OutputStreamer;

/// Configuration for the task executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// SIGTERM to SIGKILL grace for timed-out scripts and containers
    pub kill_grace: Duration,
    pub shell_timeout: Duration,
    /// Per-stream capture cap for shell and container runs
    pub output_limit: usize,
    /// Echo streamed output to this process's console
    pub echo_output: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_secs(5),
            shell_timeout: DEFAULT_SHELL_TIMEOUT,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            echo_output: true,
        }
    }
}

impl From<&AgentConfig> for ExecutorConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            kill_grace: config.kill_grace,
            ..Self::default()
        }
    }
}

/// Runs one task end to end: bundle, dispatch, supervise
pub struct TaskExecutor {
    config: ExecutorConfig,
    materializer: BundleMaterializer,
    runtimes: Arc<RuntimeMap>,
}

impl TaskExecutor {
    pub fn new(config: ExecutorConfig, materializer: BundleMaterializer, runtimes: Arc<RuntimeMap>) -> Self {
        Self {
            config,
            materializer,
            runtimes,
        }
    }

    /// Build an executor from the agent configuration
    pub fn from_agent_config(config: &AgentConfig, runtimes: Arc<RuntimeMap>) -> Result<Self> {
        let materializer = BundleMaterializer::new(WorkdirManager::new(&config.work_dir), config.download_timeout)?;
        Ok(Self::new(ExecutorConfig::from(config), materializer, runtimes))
    }

    pub fn runtimes(&self) -> &RuntimeMap {
        &self.runtimes
    }

    pub fn workdirs(&self) -> &WorkdirManager {
        self.materializer.workdirs()
    }

    /// Execute a task
    ///
    /// Streamed output goes to `sink` when given. No step is retried.
    pub async fn execute(&self, task: &Task, sink: Option<Arc<dyn OutputSink>>) -> Result<ExecutionResult> {
        let started = Instant::now();
        info!("Executing task {}", task.id);

        let result = self.run(task, sink).await;
        let elapsed = started.elapsed().as_secs();

        match result {
            Ok(output) => {
                info!("Task {} completed in {}s", task.id, elapsed);
                Ok(ExecutionResult::success(output, elapsed))
            }
            Err(e) => {
                error!("Task {} failed after {}s: {}", task.id, elapsed, e);
                Err(e)
            }
        }
    }

    async fn run(&self, task: &Task, sink: Option<Arc<dyn OutputSink>>) -> Result<String> {
        let workdir = self.materializer.materialize(task).await?;
        let config = task
            .parse_config()
            .map_err(|e| ExecutorError::InvalidConfig { message: e.to_string() })?;
        let plan = ExecutionPlan::resolve(task, &config)?;
        info!("Task {} dispatched as {:?} in {:?}", task.id, plan, workdir);

        match plan {
            ExecutionPlan::Container => {
                let docker = command_for(&self.runtimes, "docker").ok_or(ExecutorError::ContainerUnavailable)?;
                ContainerSupervisor::new(docker, self.config.kill_grace)
                    .run(task, &workdir, &config)
                    .await
            }
            ExecutionPlan::Shell => {
                ShellSupervisor::new(self.config.shell_timeout, self.config.output_limit)
                    .run(&workdir, &config)
                    .await
            }
            ExecutionPlan::Script(language) => {
                let interpreter = command_for(&self.runtimes, language.as_str()).ok_or_else(|| {
                    ExecutorError::RuntimeUnavailable {
                        runtime: language.as_str().to_string(),
                    }
                })?;
                let supervisor = ScriptSupervisor::new(language, interpreter, self.config.kill_grace);

                let (chunks, streamer) = OutputStreamer::new(task.id.clone(), sink)
                    .echo(self.config.echo_output)
                    .spawn();
                let result = supervisor.run(&workdir, &config, chunks).await;
                streamer.finish().await;
                result
            }
        }
    }
}
