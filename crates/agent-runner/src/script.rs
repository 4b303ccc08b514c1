//! Interpreted-script supervisor (python, node)

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use agent_core::client::OutputChunk;
use agent_core::task::ExecutionConfig;

use crate::error::{ExecutorError, Result};
use crate::process::{self, ProcessOutcome, ProcessSpec, TimeoutAction};
use crate::result_file::StructuredResult;
use crate::runtime::ScriptLanguage;
use crate::streaming::ChunkSender;
use crate::venv::{self, Venv};

pub const DEFAULT_SUCCESS_OUTPUT: &str = "Task completed successfully";

/// Bundled package directories added to `PYTHONPATH`, first match wins
const PYTHON_PACKAGE_DIRS: [&str; 4] = ["packages", "site-packages", "lib", "vendor"];

/// Runs one script with a guest interpreter and streams its output
#[derive(Debug, Clone)]
pub struct ScriptSupervisor {
    language: ScriptLanguage,
    interpreter: String,
    kill_grace: Duration,
}

impl ScriptSupervisor {
    pub fn new(language: ScriptLanguage, interpreter: impl Into<String>, kill_grace: Duration) -> Self {
        Self {
            language,
            interpreter: interpreter.into(),
            kill_grace,
        }
    }

    /// Run the bundle's script; returns the output to report
    pub async fn run(&self, workdir: &Path, config: &ExecutionConfig, chunks: ChunkSender) -> Result<String> {
        let script = locate_script(workdir, self.language).await?;
        info!("Running {:?} with {}", script, self.interpreter);

        let venv = if self.language == ScriptLanguage::Python && venv::has_requirements(workdir).await {
            Venv::prepare(workdir, &self.interpreter, &chunks).await
        } else {
            None
        };

        let mut env: Vec<(String, String)> = config
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.extend(language_env(self.language, workdir, config).await);

        let program: PathBuf = match &venv {
            Some(venv) => {
                env.extend(venv.env());
                venv.python().to_path_buf()
            }
            None => PathBuf::from(&self.interpreter),
        };

        let spec = ProcessSpec::new(&program, workdir)
            .arg(script.file_name().unwrap_or(script.as_os_str()))
            .envs(env)
            .timeout(
                config.timeout(),
                TimeoutAction::Terminate {
                    grace: self.kill_grace,
                },
            );

        let outcome = process::run(spec, Some(chunks.clone())).await;

        if let Some(venv) = venv {
            venv.remove().await;
        }

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e @ ExecutorError::SpawnFailed { .. }) => {
                let _ = chunks.send(OutputChunk::stderr(format!("{}\n", e)));
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let structured = StructuredResult::load(workdir).await;
        interpret(outcome, structured)
    }
}

/// Map an exit into the reported output or error
pub(crate) fn interpret(outcome: ProcessOutcome, structured: Option<StructuredResult>) -> Result<String> {
    if outcome.success() {
        let output = structured
            .as_ref()
            .and_then(StructuredResult::success_output)
            .or_else(|| non_empty(&outcome.stdout))
            .unwrap_or_else(|| DEFAULT_SUCCESS_OUTPUT.to_string());
        return Ok(output);
    }

    let message = structured
        .as_ref()
        .and_then(StructuredResult::error_message)
        .or_else(|| non_empty(&outcome.stderr));
    match message {
        Some(message) => Err(ExecutorError::ProcessExited {
            code: outcome.code,
            message,
        }),
        None => Err(ExecutorError::exited(outcome.code)),
    }
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Find the script to run
///
/// The conventional entry point wins; otherwise the single top-level file
/// with the language's extension.
pub async fn locate_script(workdir: &Path, language: ScriptLanguage) -> Result<PathBuf> {
    let entry = workdir.join(language.entry_point());
    if tokio::fs::metadata(&entry).await.is_ok_and(|m| m.is_file()) {
        return Ok(entry);
    }

    let mut names = Vec::new();
    let mut candidates = Vec::new();
    let mut entries = tokio::fs::read_dir(workdir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await?.is_file() && name.ends_with(language.extension()) {
            candidates.push(entry.path());
        }
        names.push(name);
    }

    if candidates.len() == 1 {
        let script = candidates.remove(0);
        debug!("Using {:?} as entry point", script);
        return Ok(script);
    }

    names.sort();
    Err(ExecutorError::ScriptNotFound {
        extension: language.extension(),
        dir: workdir.to_path_buf(),
        contents: names.join(", "),
    })
}

/// Interpreter variables for a language, on top of the task's own
async fn language_env(language: ScriptLanguage, workdir: &Path, config: &ExecutionConfig) -> Vec<(String, String)> {
    match language {
        ScriptLanguage::Python => {
            let mut env = vec![
                ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
                ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
            ];
            if let Some(packages) = first_dir(workdir, &PYTHON_PACKAGE_DIRS).await {
                let existing = config
                    .environment
                    .get("PYTHONPATH")
                    .cloned()
                    .or_else(|| std::env::var("PYTHONPATH").ok())
                    .filter(|p| !p.is_empty());
                let mut paths = vec![packages];
                if let Some(existing) = existing {
                    paths.extend(std::env::split_paths(&existing));
                }
                if let Ok(joined) = std::env::join_paths(paths) {
                    env.push(("PYTHONPATH".to_string(), joined.to_string_lossy().into_owned()));
                }
            }
            env
        }
        ScriptLanguage::Node => match first_dir(workdir, &["node_modules"]).await {
            Some(modules) => vec![("NODE_PATH".to_string(), modules.to_string_lossy().into_owned())],
            None => Vec::new(),
        },
    }
}

async fn first_dir(workdir: &Path, names: &[&str]) -> Option<PathBuf> {
    for name in names {
        let candidate = workdir.join(name);
        if tokio::fs::metadata(&candidate).await.is_ok_and(|m| m.is_dir()) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::client::OutputStream;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn outcome(code: i32, stdout: &str, stderr: &str) -> ProcessOutcome {
        ProcessOutcome {
            code: Some(code),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    #[test]
    fn test_interpret_success_precedence() {
        let structured = StructuredResult {
            result: Some(serde_json::json!(42)),
            ..Default::default()
        };
        assert_eq!(interpret(outcome(0, "printed\n", ""), Some(structured)).unwrap(), "42");
        assert_eq!(interpret(outcome(0, "  printed\n", ""), None).unwrap(), "printed");
        assert_eq!(interpret(outcome(0, "", ""), None).unwrap(), DEFAULT_SUCCESS_OUTPUT);
    }

    #[test]
    fn test_interpret_failure_precedence() {
        let structured = StructuredResult {
            error: Some(serde_json::json!("bad input")),
            ..Default::default()
        };
        let err = interpret(outcome(1, "", "Traceback"), Some(structured)).unwrap_err();
        assert_eq!(err.to_string(), "bad input");

        let err = interpret(outcome(1, "", "Traceback\n"), None).unwrap_err();
        assert_eq!(err.to_string(), "Traceback");

        let err = interpret(outcome(3, "out", ""), None).unwrap_err();
        assert_eq!(err.to_string(), "Process exited with code 3");
    }

    #[tokio::test]
    async fn test_locate_script() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("job.py"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();
        assert_eq!(
            locate_script(dir.path(), ScriptLanguage::Python).await.unwrap(),
            dir.path().join("job.py")
        );

        std::fs::write(dir.path().join("other.py"), "").unwrap();
        let err = locate_script(dir.path(), ScriptLanguage::Python).await.unwrap_err();
        assert!(err.to_string().contains("job.py, notes.txt, other.py"));

        std::fs::write(dir.path().join("main.py"), "").unwrap();
        assert_eq!(
            locate_script(dir.path(), ScriptLanguage::Python).await.unwrap(),
            dir.path().join("main.py")
        );

        assert!(matches!(
            locate_script(dir.path(), ScriptLanguage::Node).await,
            Err(ExecutorError::ScriptNotFound { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_python_env_prefixes_bundled_packages() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("vendor")).unwrap();
        std::fs::create_dir(dir.path().join("site-packages")).unwrap();
        let mut config = ExecutionConfig::default();
        config.environment.insert("PYTHONPATH".into(), "/opt/extra".into());

        let env = language_env(ScriptLanguage::Python, dir.path(), &config).await;
        let python_path = env.iter().find(|(k, _)| k == "PYTHONPATH").unwrap().1.clone();
        let expected = format!("{}:/opt/extra", dir.path().join("site-packages").display());
        assert_eq!(python_path, expected);
        assert!(env.contains(&("PYTHONUNBUFFERED".to_string(), "1".to_string())));
    }

    // The interpreter comes from the capability map, so `sh` can stand in
    #[tokio::test]
    async fn test_run_streams_and_reads_result_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("main.py"),
            "echo starting\necho \"$GREETING\" >&2\necho '{\"result\": {\"ok\": true}}' > result.json\n",
        )
        .unwrap();
        let config = ExecutionConfig::parse(&serde_json::json!({"environment": {"GREETING": "hi"}})).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let supervisor = ScriptSupervisor::new(ScriptLanguage::Python, "sh", Duration::from_secs(1));
        let output = supervisor.run(dir.path(), &config, tx).await.unwrap();
        assert_eq!(output, r#"{"ok":true}"#);

        let mut streamed = Vec::new();
        while let Some(chunk) = rx.recv().await {
            streamed.push(chunk);
        }
        assert!(streamed.iter().any(|c| c.stream == OutputStream::Stdout && c.data.contains("starting")));
        assert!(streamed.iter().any(|c| c.stream == OutputStream::Stderr && c.data.contains("hi")));
    }

    /// Bundle whose `sh -m venv .venv` builds an environment with a
    /// recording interpreter and a pip that succeeds
    #[cfg(unix)]
    fn venv_bundle(main: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "requests==2.31.0\n").unwrap();
        std::fs::write(dir.path().join("main.py"), main).unwrap();
        std::fs::write(
            dir.path().join("venv"),
            "mkdir -p \"$1/bin\"\n\
             printf '#!/bin/sh\\necho \"interpreter $0\"\\nexec sh \"$@\"\\n' > \"$1/bin/python\"\n\
             printf '#!/bin/sh\\nexit 0\\n' > \"$1/bin/pip\"\n\
             chmod +x \"$1/bin/python\" \"$1/bin/pip\"\n",
        )
        .unwrap();
        dir
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_with_venv_interpreter_and_removes_it() {
        let dir = venv_bundle("echo \"env $VIRTUAL_ENV\"\n");
        let (tx, _rx) = mpsc::unbounded_channel();

        let supervisor = ScriptSupervisor::new(ScriptLanguage::Python, "sh", Duration::from_secs(1));
        let output = supervisor
            .run(dir.path(), &ExecutionConfig::default(), tx)
            .await
            .unwrap();

        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("interpreter "));
        assert!(lines[0].ends_with(".venv/bin/python"));
        assert!(lines[1].starts_with("env "));
        assert!(lines[1].ends_with(".venv"));
        assert!(!dir.path().join(venv::VENV_DIR).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_venv_removed_after_failing_script() {
        let dir = venv_bundle("echo broken >&2\nexit 3\n");
        let (tx, _rx) = mpsc::unbounded_channel();

        let supervisor = ScriptSupervisor::new(ScriptLanguage::Python, "sh", Duration::from_secs(1));
        let err = supervisor
            .run(dir.path(), &ExecutionConfig::default(), tx)
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutorError::ProcessExited { code: Some(3), .. }));
        assert_eq!(err.to_string(), "broken");
        assert!(!dir.path().join(venv::VENV_DIR).exists());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_streamed() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.js"), "").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let supervisor = ScriptSupervisor::new(ScriptLanguage::Node, "no-such-node-xyz", Duration::from_secs(1));
        let err = supervisor
            .run(dir.path(), &ExecutionConfig::default(), tx)
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutorError::SpawnFailed { .. }));
        let chunk = rx.recv().await.unwrap();
        assert_eq!(chunk.stream, OutputStream::Stderr);
        assert!(chunk.data.contains("no-such-node-xyz"));
    }
}
