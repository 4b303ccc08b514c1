//! Stable worker identity

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::system;

/// Who this worker is, as reported to the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostIdentity {
    /// Deterministic id derived from `mac_address`
    pub stable_id: String,
    /// Normalized hardware address (or hostname when none was found)
    pub mac_address: String,
    pub hostname: String,
    pub platform: String,
    pub architecture: String,
}

impl HostIdentity {
    /// Resolve identity from the override, the first physical interface, or
    /// the hostname, in that order.
    pub fn detect(identity_override: Option<&str>) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let hardware = identity_override
            .map(str::to_string)
            .or_else(system::mac_address);
        Self::from_parts(hardware, hostname)
    }

    pub fn from_parts(hardware: Option<String>, hostname: String) -> Self {
        let source = hardware
            .map(|h| normalize_hardware_id(&h))
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| normalize_hardware_id(&hostname));

        Self {
            stable_id: stable_worker_id(&source),
            mac_address: source,
            hostname,
            platform: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
        }
    }
}

/// Lowercase and strip everything that is not alphanumeric, so
/// `AA:BB-cc.dd` and `aabbccdd` name the same host.
pub fn normalize_hardware_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

pub fn stable_worker_id(normalized: &str) -> String {
    let digest = Sha256::digest(normalized.as_bytes());
    format!("worker-{}", &hex::encode(digest)[..16])
}
