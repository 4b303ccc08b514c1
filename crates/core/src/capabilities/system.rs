//! Host resource inspection
//!
//! Linux reads `/proc` and `/sys`; other platforms report zeros.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

const GPU_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// GPUs visible through `nvidia-smi`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuInfo {
    pub count: u32,
    pub model: Option<String>,
    pub memory_mb: Option<u64>,
}

/// Hardware address of the first physical network interface
#[cfg(target_os = "linux")]
pub(crate) fn mac_address() -> Option<String> {
    const VIRTUAL_PREFIXES: &[&str] = &["lo", "docker", "veth", "br-", "virbr", "cni", "flannel"];

    let mut interfaces: Vec<_> = std::fs::read_dir("/sys/class/net")
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| !VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p)))
        .collect();
    interfaces.sort();

    interfaces.into_iter().find_map(|name| {
        let address = std::fs::read_to_string(format!("/sys/class/net/{}/address", name)).ok()?;
        let address = address.trim();
        (!address.is_empty() && address != "00:00:00:00:00:00").then(|| address.to_string())
    })
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn mac_address() -> Option<String> {
    None
}

/// (total, available) RAM in MiB
#[cfg(target_os = "linux")]
pub(crate) fn memory_mb() -> (u64, u64) {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return (0, 0);
    };
    parse_meminfo(&meminfo)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn memory_mb() -> (u64, u64) {
    (0, 0)
}

/// Currently available RAM in MiB, as sent in heartbeats
pub fn available_ram_mb() -> u64 {
    memory_mb().1
}

fn parse_meminfo(meminfo: &str) -> (u64, u64) {
    let mut total = 0;
    let mut available = 0;
    for line in meminfo.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 2 {
            match parts[0] {
                "MemTotal:" => total = parts[1].parse::<u64>().unwrap_or(0) / 1024,
                "MemAvailable:" => available = parts[1].parse::<u64>().unwrap_or(0) / 1024,
                _ => {}
            }
        }
    }
    (total, available)
}

#[cfg(target_os = "linux")]
pub(crate) fn cpu_model() -> String {
    std::fs::read_to_string("/proc/cpuinfo")
        .ok()
        .and_then(|info| {
            info.lines()
                .find(|line| line.starts_with("model name"))
                .and_then(|line| line.split_once(':'))
                .map(|(_, model)| model.trim().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn cpu_model() -> String {
    "unknown".to_string()
}

/// (total, available) storage in GiB for the filesystem holding `path`.
/// Walks up to the nearest existing ancestor first.
#[cfg(unix)]
pub(crate) fn storage_gb(path: &Path) -> (u64, u64) {
    use nix::sys::statvfs::statvfs;

    const GIB: u64 = 1024 * 1024 * 1024;
    let Some(existing) = path.ancestors().find(|p| p.exists()) else {
        return (0, 0);
    };
    match statvfs(existing) {
        Ok(stat) => {
            let fragment = stat.fragment_size() as u64;
            (
                stat.blocks() as u64 * fragment / GIB,
                stat.blocks_available() as u64 * fragment / GIB,
            )
        }
        Err(e) => {
            debug!("statvfs({}) failed: {}", existing.display(), e);
            (0, 0)
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn storage_gb(_path: &Path) -> (u64, u64) {
    (0, 0)
}

pub(crate) async fn detect_gpus() -> GpuInfo {
    let query = Command::new("nvidia-smi")
        .args(["--query-gpu=name,memory.total", "--format=csv,noheader,nounits"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(GPU_QUERY_TIMEOUT, query).await {
        Ok(Ok(output)) if output.status.success() => {
            parse_gpu_query(&String::from_utf8_lossy(&output.stdout))
        }
        _ => {
            debug!("No NVIDIA GPU detected");
            GpuInfo::default()
        }
    }
}

fn parse_gpu_query(stdout: &str) -> GpuInfo {
    let rows: Vec<(String, Option<u64>)> = stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let mut fields = line.split(',').map(str::trim);
            let name = fields.next().unwrap_or_default().to_string();
            let memory = fields.next().and_then(|m| m.parse().ok());
            (name, memory)
        })
        .collect();

    GpuInfo {
        count: rows.len() as u32,
        model: rows.first().map(|(name, _)| name.clone()),
        memory_mb: rows.first().and_then(|(_, memory)| *memory),
    }
}
