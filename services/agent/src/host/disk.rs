//! [`DiskHost`] for raw image files on local disk.

use std::path::Path;

use async_trait::async_trait;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use super::exec::run;
use super::{CopyResult, DiskHost, HostError};

const COPY_BUF_SIZE: usize = 1024 * 1024;

/// Creates images with `qemu-img`, copies and downloads with tokio I/O.
#[derive(Debug, Clone)]
pub struct LocalDiskHost {
    client: reqwest::Client,
}

impl LocalDiskHost {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for LocalDiskHost {
    fn default() -> Self {
        Self::new()
    }
}

async fn ensure_parent(path: &Path) -> Result<(), HostError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(())
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait]
impl DiskHost for LocalDiskHost {
    async fn image_exists(&self, path: &Path) -> Result<bool, HostError> {
        Ok(fs::try_exists(path).await?)
    }

    async fn create_image(&self, path: &Path, size_bytes: u64) -> Result<(), HostError> {
        ensure_parent(path).await?;
        info!(path = %path.display(), size_bytes, "Creating disk image");
        run(
            "qemu-img",
            &["create", "-f", "raw", &path_str(path), &size_bytes.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn image_size(&self, path: &Path) -> Result<u64, HostError> {
        Ok(fs::metadata(path).await?.len())
    }

    async fn copy_image(&self, src: &Path, dst: &Path) -> Result<CopyResult, HostError> {
        ensure_parent(dst).await?;
        info!(src = %src.display(), dst = %dst.display(), "Copying disk image");

        let mut reader = fs::File::open(src).await?;
        let mut writer = fs::File::create(dst).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut size_bytes = 0u64;

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            writer.write_all(&buf[..n]).await?;
            size_bytes += n as u64;
        }
        writer.flush().await?;
        writer.sync_all().await?;

        let sha256 = hex::encode(hasher.finalize());
        debug!(dst = %dst.display(), size_bytes, sha256 = %sha256, "Copy complete");
        Ok(CopyResult { size_bytes, sha256 })
    }

    async fn download(&self, url: &str, dst: &Path) -> Result<u64, HostError> {
        ensure_parent(dst).await?;
        info!(url = %url, dst = %dst.display(), "Downloading disk image");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| HostError::Download(e.to_string()))?;

        let mut writer = fs::File::create(dst).await?;
        let mut stream = response.bytes_stream();
        let mut size_bytes = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| HostError::Download(e.to_string()))?;
            writer.write_all(&chunk).await?;
            size_bytes += chunk.len() as u64;
        }
        writer.flush().await?;
        writer.sync_all().await?;

        Ok(size_bytes)
    }

    async fn remove_image(&self, path: &Path) -> Result<(), HostError> {
        match fs::remove_file(path).await {
            Ok(()) => {
                info!(path = %path.display(), "Removed disk image");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
