//! Runtime names and execution plan selection

use agent_core::task::{ExecutionConfig, Task};
use agent_core::RuntimeMap;

use crate::error::{ExecutorError, Result};

/// Interpreted languages with a script supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptLanguage {
    Python,
    Node,
}

impl ScriptLanguage {
    /// Key of this language in the runtime map
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Node => "node",
        }
    }

    /// Conventional entry point looked for first
    pub fn entry_point(&self) -> &'static str {
        match self {
            Self::Python => "main.py",
            Self::Node => "index.js",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Python => ".py",
            Self::Node => ".js",
        }
    }
}

/// How a task will be run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPlan {
    Script(ScriptLanguage),
    Shell,
    Container,
}

impl ExecutionPlan {
    /// Pick the supervisor for a task
    ///
    /// A container image or the docker flag always wins. Otherwise the
    /// config's runtime, then the task's, then `shell` for a bare command
    /// and `python` for everything else.
    pub fn resolve(task: &Task, config: &ExecutionConfig) -> Result<Self> {
        let wants_container = config.docker_image().is_some()
            || task.docker_image.as_deref().is_some_and(|s| !s.trim().is_empty())
            || task.is_docker;
        if wants_container {
            return Ok(Self::Container);
        }

        let named = config
            .runtime()
            .or_else(|| task.runtime.as_deref().map(str::trim).filter(|s| !s.is_empty()));

        match named {
            Some(name) => Self::from_name(name),
            None if config.command().is_some() => Ok(Self::Shell),
            None => Ok(Self::Script(ScriptLanguage::Python)),
        }
    }

    /// Parse a runtime name as used in tasks and configs
    pub fn from_name(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Self::Script(ScriptLanguage::Python)),
            "node" | "nodejs" | "javascript" | "js" => Ok(Self::Script(ScriptLanguage::Node)),
            "shell" | "bash" | "sh" => Ok(Self::Shell),
            "docker" | "container" => Ok(Self::Container),
            _ => Err(ExecutorError::UnknownRuntime {
                runtime: s.to_string(),
            }),
        }
    }
}

/// Executable for a runtime, if the probe found it
pub fn command_for<'a>(runtimes: &'a RuntimeMap, name: &'a str) -> Option<&'a str> {
    runtimes
        .get(name)
        .filter(|info| info.available)
        .map(|info| info.command.as_deref().unwrap_or(name))
}
