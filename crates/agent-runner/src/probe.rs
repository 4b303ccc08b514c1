//! Guest runtime detection

use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info};

use agent_core::capabilities::{RuntimeInfo, RuntimeMap};

use crate::command::run_bounded;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One runtime and the executables that may provide it, in preference order
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub name: String,
    pub candidates: Vec<String>,
    pub args: Vec<String>,
}

impl ProbeTarget {
    pub fn new(name: &str, candidates: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            candidates: candidates.iter().map(|c| c.to_string()).collect(),
            args: vec!["--version".to_string()],
        }
    }

    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }
}

/// Detects which guest runtimes are installed
#[derive(Debug, Clone)]
pub struct RuntimeCapabilityProbe {
    targets: Vec<ProbeTarget>,
    timeout: Duration,
}

impl Default for RuntimeCapabilityProbe {
    fn default() -> Self {
        Self {
            targets: vec![
                ProbeTarget::new("python", &["python3", "python"]),
                ProbeTarget::new("node", &["node"]),
                ProbeTarget::new("bash", &["bash"]),
                ProbeTarget::new("docker", &["docker"]),
                ProbeTarget::new("rust", &["rustc"]),
            ],
            timeout: PROBE_TIMEOUT,
        }
    }
}

impl RuntimeCapabilityProbe {
    pub fn with_targets(targets: Vec<ProbeTarget>) -> Self {
        Self {
            targets,
            timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Probe every runtime concurrently
    ///
    /// A failing probe only marks its own runtime unavailable.
    pub async fn detect_all(&self) -> RuntimeMap {
        let results = join_all(self.targets.iter().map(|target| self.probe(target))).await;
        let runtimes: RuntimeMap = self
            .targets
            .iter()
            .map(|t| t.name.clone())
            .zip(results)
            .collect();

        let available: Vec<&str> = runtimes
            .iter()
            .filter(|(_, info)| info.available)
            .map(|(name, _)| name.as_str())
            .collect();
        info!("Detected runtimes: {:?}", available);
        runtimes
    }

    async fn probe(&self, target: &ProbeTarget) -> RuntimeInfo {
        for candidate in &target.candidates {
            match run_bounded(candidate, target.args.as_slice(), None, &[], self.timeout).await {
                Ok(output) if output.success => {
                    let version = output.first_line().map(parse_version).unwrap_or_default();
                    debug!("{} available via {} ({})", target.name, candidate, version);
                    return RuntimeInfo::available(version, candidate.as_str());
                }
                Ok(_) => debug!("{} probe via {} exited unsuccessfully", target.name, candidate),
                Err(e) => debug!("{} probe via {} failed: {}", target.name, candidate, e),
            }
        }
        RuntimeInfo::unavailable()
    }
}

/// Pull the version token out of a `--version` banner
///
/// `Python 3.11.4` gives `3.11.4`, `v20.5.0` gives `20.5.0`,
/// `Docker version 24.0.5, build ced0996` gives `24.0.5`.
fn parse_version(line: &str) -> String {
    line.split_whitespace()
        .map(|token| token.trim_end_matches(','))
        .map(|token| token.strip_prefix('v').unwrap_or(token))
        .find(|token| token.starts_with(|c: char| c.is_ascii_digit()))
        .unwrap_or(line)
        .to_string()
}
