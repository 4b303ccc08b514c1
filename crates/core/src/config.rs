//! Environment-driven agent configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;
use crate::Result;

pub const DEFAULT_API_URL: &str = "http://localhost:3000";

/// Everything the agent reads from its environment at startup
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Control-plane base URL, without trailing slash
    pub api_url: String,
    /// Bearer token, from `--api-key` or `WORKER_API_KEY`
    pub api_key: String,
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    /// Whether the agent itself runs inside a container
    pub in_container: bool,
    /// Replaces the detected hardware address as identity source
    pub identity_override: Option<String>,
    /// Root under which per-task working directories are created
    pub work_dir: PathBuf,
    pub debug: bool,
    /// Reserved, not consulted by the agent yet
    pub max_retries: u32,
    /// Reserved, not consulted by the agent yet
    pub retry_delay: Duration,
    pub request_timeout: Duration,
    pub download_timeout: Duration,
    /// Delay between the offline heartbeat and process exit
    pub shutdown_grace: Duration,
    /// Delay between SIGTERM and SIGKILL on task timeout
    pub kill_grace: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: String::new(),
            heartbeat_interval: Duration::from_secs(60),
            poll_interval: Duration::from_secs(10),
            in_container: false,
            identity_override: None,
            work_dir: std::env::temp_dir().join("worker-agent").join("tasks"),
            debug: false,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(3),
            kill_grace: Duration::from_secs(5),
        }
    }
}

impl AgentConfig {
    /// Load from process environment variables
    pub fn from_env(api_key: impl Into<String>) -> Result<Self> {
        Self::from_lookup(api_key, |name| std::env::var(name).ok())
    }

    /// Load using an arbitrary variable lookup
    pub fn from_lookup<F>(api_key: impl Into<String>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(Error::Config("an API key is required".into()));
        }

        let api_url = var("WORKER_API_URL")
            .unwrap_or(defaults.api_url)
            .trim_end_matches('/')
            .to_string();
        if !api_url.starts_with("http://") && !api_url.starts_with("https://") {
            return Err(Error::Config(format!(
                "WORKER_API_URL must be an http(s) URL, got {}",
                api_url
            )));
        }

        let seconds = |name: &str, default: Duration| -> Result<Duration> {
            match var(name) {
                None => Ok(default),
                Some(raw) => raw
                    .parse::<u64>()
                    .ok()
                    .filter(|s| *s > 0)
                    .map(Duration::from_secs)
                    .ok_or_else(|| {
                        Error::Config(format!("{} must be a positive number of seconds, got {}", name, raw))
                    }),
            }
        };

        let in_container = env_flag(var("WORKER_IN_CONTAINER"), false)
            || Path::new("/.dockerenv").exists();

        Ok(Self {
            api_url,
            api_key,
            heartbeat_interval: seconds("WORKER_HEARTBEAT_INTERVAL", defaults.heartbeat_interval)?,
            poll_interval: seconds("WORKER_POLL_INTERVAL", defaults.poll_interval)?,
            in_container,
            identity_override: var("WORKER_MAC_ADDRESS"),
            work_dir: var("WORKER_WORK_DIR").map(PathBuf::from).unwrap_or(defaults.work_dir),
            debug: env_flag(var("WORKER_DEBUG"), false),
            max_retries: match var("WORKER_MAX_RETRIES") {
                None => defaults.max_retries,
                Some(raw) => raw.parse::<u32>().map_err(|_| {
                    Error::Config(format!("WORKER_MAX_RETRIES must be a non-negative integer, got {}", raw))
                })?,
            },
            retry_delay: seconds("WORKER_RETRY_DELAY", defaults.retry_delay)?,
            request_timeout: seconds("WORKER_REQUEST_TIMEOUT", defaults.request_timeout)?,
            download_timeout: seconds("WORKER_DOWNLOAD_TIMEOUT", defaults.download_timeout)?,
            shutdown_grace: defaults.shutdown_grace,
            kill_grace: defaults.kill_grace,
        })
    }
}

/// Boolean environment flag: accepts 1/true/yes/on and 0/false/no/off
fn env_flag(raw: Option<String>, default: bool) -> bool {
    match raw {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AgentConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AgentConfig::from_lookup("secret", move |name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(60));
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.identity_override.is_none());
        assert!(!config.debug);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("WORKER_API_URL", "https://cp.example.com/"),
            ("WORKER_POLL_INTERVAL", "2"),
            ("WORKER_DEBUG", "yes"),
            ("WORKER_MAC_ADDRESS", "AA:BB:CC:DD:EE:FF"),
            ("WORKER_WORK_DIR", "/srv/tasks"),
        ])
        .unwrap();

        assert_eq!(config.api_url, "https://cp.example.com");
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert!(config.debug);
        assert_eq!(config.identity_override.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(config.work_dir, PathBuf::from("/srv/tasks"));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(load(&[("WORKER_POLL_INTERVAL", "0")]).is_err());
        assert!(load(&[("WORKER_HEARTBEAT_INTERVAL", "soon")]).is_err());
        assert!(load(&[("WORKER_API_URL", "ftp://nope")]).is_err());
        assert!(AgentConfig::from_lookup("  ", |_| None).is_err());
    }

    #[test]
    fn test_max_retries_parsed_strictly() {
        assert_eq!(load(&[("WORKER_MAX_RETRIES", "0")]).unwrap().max_retries, 0);
        assert_eq!(load(&[("WORKER_MAX_RETRIES", "7")]).unwrap().max_retries, 7);

        let err = load(&[("WORKER_MAX_RETRIES", "many")]).unwrap_err();
        assert!(err.to_string().contains("WORKER_MAX_RETRIES"));
        assert!(load(&[("WORKER_MAX_RETRIES", "-1")]).is_err());
    }

    #[test]
    fn test_env_flag() {
        assert!(env_flag(Some("ON".into()), false));
        assert!(!env_flag(Some("0".into()), true));
        assert!(env_flag(Some("maybe".into()), true));
        assert!(!env_flag(None, false));
    }
}
