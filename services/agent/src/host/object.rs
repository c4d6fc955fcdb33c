//! [`ObjectStore`] backed by the `rbd` tool.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::exec::{run, succeeds};
use super::{HostError, ObjectStore};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct RbdObjectStore;

impl RbdObjectStore {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Deserialize)]
struct RbdInfo {
    size: u64,
}

#[derive(Debug, Deserialize)]
struct RbdSnapshot {
    name: String,
}

fn parse<T: for<'de> Deserialize<'de>>(command: &str, out: &str) -> Result<T, HostError> {
    serde_json::from_str(out).map_err(|e| HostError::Parse {
        command: command.to_string(),
        detail: e.to_string(),
    })
}

#[async_trait]
impl ObjectStore for RbdObjectStore {
    async fn image_exists(&self, image: &str) -> Result<bool, HostError> {
        succeeds("rbd", &["info", image]).await
    }

    async fn create_image(&self, image: &str, size_bytes: u64) -> Result<(), HostError> {
        // rbd sizes are MiB; round up
        let size_mib = size_bytes.div_ceil(MIB).max(1).to_string();
        info!(image = %image, size_bytes, "Creating object image");
        run("rbd", &["create", "--size", &size_mib, image]).await?;
        Ok(())
    }

    async fn image_size(&self, image: &str) -> Result<u64, HostError> {
        let out = run("rbd", &["info", "--format", "json", image]).await?;
        let info: RbdInfo = parse("rbd info", &out)?;
        Ok(info.size)
    }

    async fn copy_image(&self, src: &str, dst: &str) -> Result<(), HostError> {
        info!(src = %src, dst = %dst, "Copying object image");
        run("rbd", &["cp", src, dst]).await?;
        Ok(())
    }

    async fn clone_image(&self, snapshot: &str, dst: &str) -> Result<(), HostError> {
        info!(snapshot = %snapshot, dst = %dst, "Cloning object image");
        run("rbd", &["clone", snapshot, dst]).await?;
        Ok(())
    }

    async fn import_image(&self, src: &Path, image: &str) -> Result<(), HostError> {
        info!(src = %src.display(), image = %image, "Importing object image");
        run("rbd", &["import", &src.to_string_lossy(), image]).await?;
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<(), HostError> {
        info!(image = %image, "Removing object image");
        run("rbd", &["rm", image]).await?;
        Ok(())
    }

    async fn list_snapshots(&self, image: &str) -> Result<Vec<String>, HostError> {
        let out = run("rbd", &["snap", "ls", "--format", "json", image]).await?;
        let snaps: Vec<RbdSnapshot> = parse("rbd snap ls", &out)?;
        Ok(snaps.into_iter().map(|s| s.name).collect())
    }

    async fn create_snapshot(&self, image: &str, snap: &str) -> Result<(), HostError> {
        run("rbd", &["snap", "create", &format!("{}@{}", image, snap)]).await?;
        Ok(())
    }

    async fn protect_snapshot(&self, image: &str, snap: &str) -> Result<(), HostError> {
        run("rbd", &["snap", "protect", &format!("{}@{}", image, snap)]).await?;
        Ok(())
    }

    async fn unprotect_snapshot(&self, image: &str, snap: &str) -> Result<(), HostError> {
        run("rbd", &["snap", "unprotect", &format!("{}@{}", image, snap)]).await?;
        Ok(())
    }

    async fn remove_snapshot(&self, image: &str, snap: &str) -> Result<(), HostError> {
        run("rbd", &["snap", "rm", &format!("{}@{}", image, snap)]).await?;
        Ok(())
    }
}
