//! Archive extraction
//!
//! The format is sniffed from the leading bytes: ZIP, gzip-compressed tar,
//! or plain tar. Entries that would land outside the destination are refused.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::debug;

use crate::error::{BundleError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
    Tar,
}

impl ArchiveFormat {
    /// Identify an archive from its first bytes (at least 262 for plain tar)
    pub fn detect(header: &[u8]) -> Option<Self> {
        if header.starts_with(b"PK\x03\x04") || header.starts_with(b"PK\x05\x06") {
            Some(Self::Zip)
        } else if header.starts_with(&[0x1f, 0x8b]) {
            Some(Self::TarGz)
        } else if header.len() >= 262 && &header[257..262] == b"ustar" {
            Some(Self::Tar)
        } else {
            None
        }
    }
}

/// Extract `archive` into `dest` on a blocking thread; returns the number of
/// regular files written.
pub async fn extract(archive: &Path, dest: &Path) -> Result<usize> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || extract_blocking(&archive, &dest))
        .await
        .map_err(|e| BundleError::extract(format!("extraction task failed: {}", e)))?
}

fn extract_blocking(archive: &Path, dest: &Path) -> Result<usize> {
    let mut file = File::open(archive)?;
    let mut header = Vec::with_capacity(512);
    (&mut file).take(512).read_to_end(&mut header)?;
    file.seek(SeekFrom::Start(0))?;

    let format = ArchiveFormat::detect(&header)
        .ok_or_else(|| BundleError::extract("unrecognized archive format (expected zip or tar.gz)"))?;
    debug!("Extracting {:?} archive {:?} into {:?}", format, archive, dest);

    match format {
        ArchiveFormat::Zip => extract_zip(file, dest),
        ArchiveFormat::TarGz => extract_tar(tar::Archive::new(GzDecoder::new(file)), dest),
        ArchiveFormat::Tar => extract_tar(tar::Archive::new(file), dest),
    }
}

fn extract_zip(file: File, dest: &Path) -> Result<usize> {
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| BundleError::extract(format!("invalid zip: {}", e)))?;
    let mut written = 0;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| BundleError::extract(format!("invalid zip entry: {}", e)))?;
        let relative: PathBuf = entry.enclosed_name().ok_or_else(|| {
            BundleError::extract(format!("entry {:?} escapes the working directory", entry.name()))
        })?;
        let out = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut target = File::create(&out)?;
        std::io::copy(&mut entry, &mut target)?;
        written += 1;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&out, std::fs::Permissions::from_mode(mode & 0o777))?;
        }
    }

    Ok(written)
}

fn extract_tar<R: Read>(mut archive: tar::Archive<R>, dest: &Path) -> Result<usize> {
    let mut written = 0;
    let entries = archive
        .entries()
        .map_err(|e| BundleError::extract(format!("invalid tar: {}", e)))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| BundleError::extract(format!("invalid tar entry: {}", e)))?;
        let is_file = entry.header().entry_type().is_file();
        let name = entry
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "<non-utf8>".to_string());

        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| BundleError::extract(format!("failed to unpack {}: {}", name, e)))?;
        if !unpacked {
            return Err(BundleError::extract(format!(
                "entry {:?} escapes the working directory",
                name
            )));
        }
        if is_file {
            written += 1;
        }
    }

    Ok(written)
}
