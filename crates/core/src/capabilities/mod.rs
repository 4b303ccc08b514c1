//! Worker capabilities: host identity, resources and guest runtimes
//!
//! Captured once at registration. Only available RAM and the busy/online
//! status change afterwards, and those travel in heartbeats.

mod identity;
mod system;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AgentConfig;

pub use identity::{normalize_hardware_id, stable_worker_id, HostIdentity};
pub use system::{available_ram_mb, GpuInfo};

/// Availability of one guest runtime on this host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInfo {
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Executable used to invoke the runtime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl RuntimeInfo {
    pub fn available(version: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            available: true,
            version: Some(version.into()),
            command: Some(command.into()),
        }
    }

    pub fn unavailable() -> Self {
        Self::default()
    }
}

/// Runtime name to availability, built once before the control loop starts
pub type RuntimeMap = BTreeMap<String, RuntimeInfo>;

/// Point-in-time resource figures. RAM and GPU memory in MiB, storage in GiB.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    pub cpu_cores: usize,
    pub cpu_model: String,
    pub ram_total: u64,
    pub ram_available: u64,
    pub gpu_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory: Option<u64>,
    pub gpu_count: u32,
    pub storage_total: u64,
    pub storage_available: u64,
}

/// Full snapshot sent on registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCapabilities {
    #[serde(flatten)]
    pub identity: HostIdentity,
    #[serde(flatten)]
    pub resources: ResourceSnapshot,
    pub is_docker: bool,
    pub runtimes: RuntimeMap,
}

impl WorkerCapabilities {
    /// Inspect the host. Never fails: anything that cannot be read is
    /// reported as zero or absent.
    pub async fn detect(config: &AgentConfig, runtimes: RuntimeMap) -> Self {
        let identity = HostIdentity::detect(config.identity_override.as_deref());
        let (ram_total, ram_available) = system::memory_mb();
        let (storage_total, storage_available) = system::storage_gb(&config.work_dir);
        let gpu = system::detect_gpus().await;

        debug!(
            "Detected host {} ({}/{}), {} MiB RAM, {} GPU(s)",
            identity.hostname, identity.platform, identity.architecture, ram_total, gpu.count
        );

        Self {
            identity,
            resources: ResourceSnapshot {
                cpu_cores: num_cpus::get(),
                cpu_model: system::cpu_model(),
                ram_total,
                ram_available,
                gpu_available: gpu.count > 0,
                gpu_model: gpu.model,
                gpu_memory: gpu.memory_mb,
                gpu_count: gpu.count,
                storage_total,
                storage_available,
            },
            is_docker: config.in_container,
            runtimes,
        }
    }
}
