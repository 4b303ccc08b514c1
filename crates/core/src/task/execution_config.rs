//! Per-task execution configuration

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

/// Recognized execution options of a task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConfig {
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub docker_image: Option<String>,
    #[serde(default)]
    pub docker_command: Option<String>,
    #[serde(default, deserialize_with = "de_string_map")]
    pub environment: BTreeMap<String, String>,
    /// Seconds; zero means no timeout
    #[serde(default, deserialize_with = "de_timeout")]
    pub timeout: Option<u64>,
    #[serde(default, deserialize_with = "de_string_map")]
    pub volumes: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "de_string_map")]
    pub ports: BTreeMap<String, String>,
}

impl ExecutionConfig {
    /// Parse a config that arrives either pre-structured or as a JSON string.
    pub fn parse(value: &serde_json::Value) -> serde_json::Result<Self> {
        match value {
            serde_json::Value::Null => Ok(Self::default()),
            serde_json::Value::String(raw) if raw.trim().is_empty() => Ok(Self::default()),
            serde_json::Value::String(raw) => {
                let inner: serde_json::Value = serde_json::from_str(raw)?;
                // A string holding "null" is as good as no config at all
                if inner.is_null() {
                    Ok(Self::default())
                } else {
                    serde_json::from_value(inner)
                }
            }
            other => serde_json::from_value(other.clone()),
        }
    }

    /// The inline command, ignoring blank strings
    pub fn command(&self) -> Option<&str> {
        non_blank(&self.command)
    }

    pub fn runtime(&self) -> Option<&str> {
        non_blank(&self.runtime)
    }

    pub fn docker_image(&self) -> Option<&str> {
        non_blank(&self.docker_image)
    }

    /// Command run inside the container; falls back to `command`
    pub fn docker_command(&self) -> Option<&str> {
        non_blank(&self.docker_command).or_else(|| self.command())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn de_string_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, serde_json::Value>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(key, value)| {
            let value = match value {
                serde_json::Value::Null => return None,
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            Some((key, value))
        })
        .collect())
}

fn de_timeout<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let seconds = match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(other) => {
            return Err(serde::de::Error::custom(format!(
                "timeout must be a number of seconds, got {}",
                other
            )))
        }
    };

    Ok(seconds
        .filter(|s| s.is_finite() && *s > 0.0)
        .map(|s| s.ceil() as u64))
}
