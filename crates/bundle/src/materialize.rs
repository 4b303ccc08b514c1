//! Turning a task's code reference into files on disk

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use agent_core::task::{CodeSource, Task};

use crate::archive;
use crate::error::{BundleError, Result};
use crate::workdir::WorkdirManager;

/// Temporary name of the archive inside the working directory before extraction
const ARCHIVE_FILE: &str = ".bundle.archive";

/// Materializes task bundles into per-task working directories
#[derive(Debug, Clone)]
pub struct BundleMaterializer {
    workdirs: WorkdirManager,
    http: reqwest::Client,
}

impl BundleMaterializer {
    /// Create a materializer whose remote downloads give up after `download_timeout`
    pub fn new(workdirs: WorkdirManager, download_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(download_timeout)
            .user_agent(concat!("worker-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BundleError::download("<client>", e))?;
        Ok(Self { workdirs, http })
    }

    pub fn workdirs(&self) -> &WorkdirManager {
        &self.workdirs
    }

    /// Populate a fresh working directory for `task` and return its path
    ///
    /// Resolution order: inline base64 archive, remote archive URL, then a
    /// bare inline command (empty directory). Anything else has no
    /// executable content.
    pub async fn materialize(&self, task: &Task) -> Result<PathBuf> {
        let dir = self.workdirs.reset(&task.id).await?;

        match task.code_source() {
            CodeSource::Inline(encoded) => {
                let bytes = decode_inline(encoded)?;
                info!("Task {}: unpacking inline bundle ({} bytes)", task.id, bytes.len());
                let archive_path = dir.join(ARCHIVE_FILE);
                tokio::fs::write(&archive_path, &bytes).await?;
                self.unpack(&archive_path, &dir).await?;
            }
            CodeSource::Remote(url) => {
                info!("Task {}: downloading bundle from {}", task.id, url);
                let archive_path = dir.join(ARCHIVE_FILE);
                self.download(url, &archive_path).await?;
                self.unpack(&archive_path, &dir).await?;
            }
            CodeSource::None if has_inline_command(task) => {
                debug!("Task {}: no bundle, running inline command", task.id);
            }
            CodeSource::None => {
                return Err(BundleError::NoExecutableContent {
                    task_id: task.id.clone(),
                });
            }
        }

        Ok(dir)
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| BundleError::download(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BundleError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut total = 0usize;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| BundleError::download(url, e))?;
            total += chunk.len();
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        debug!("Downloaded {} bytes from {}", total, url);
        Ok(())
    }

    /// Extract and then drop the archive file, whatever the outcome
    async fn unpack(&self, archive_path: &Path, dir: &Path) -> Result<()> {
        let result = archive::extract(archive_path, dir).await;
        if let Err(e) = tokio::fs::remove_file(archive_path).await {
            warn!("Failed to remove archive {:?}: {}", archive_path, e);
        }
        let files = result?;
        debug!("Extracted {} files into {:?}", files, dir);
        Ok(())
    }
}

/// Decode a base64 payload, tolerating line breaks and a `data:` URL prefix
fn decode_inline(encoded: &str) -> Result<Vec<u8>> {
    let payload = match encoded.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => encoded,
    };
    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Ok(base64::engine::general_purpose::STANDARD.decode(compact)?)
}

fn has_inline_command(task: &Task) -> bool {
    task.parse_config()
        .map(|config| config.command().is_some() || config.docker_command().is_some())
        .unwrap_or(false)
}
