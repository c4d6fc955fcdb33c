//! BlockStorage lifecycle on local disk or in the object store.
//!
//! ```text
//! Pending ──Empty──────────────────────────────> Active <──> Used
//!    │ ───HTTP──────> Downloading ──ok────────────^
//!    │ ───BaseImage─> Copying ──────ok────────────^
//!    │ ───BlockStorage> Copying ────ok────────────^
//!    │                    └──fail──> Error
//! ```
//!
//! Active/Used is recomputed every pass from the Running VMs that reference
//! the volume. In-flight states (and Reserved/Error) suppress that. Copies
//! and downloads are not resumable: a resource found mid-transfer at the
//! start of a pass is left alone.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use fleet_resources::{
    parse_size, BlockStorage, BlockStorageSource, BlockStorageSpec, BlockStorageState, Image,
    ImageEntity, ImageEntityState, Meta, VirtualMachine, VmState, ANNOTATION_STORAGE_BACKEND,
};
use fleet_store::Resources;
use tracing::{info, warn};

use crate::engine::{Controller, ControllerError, Outcome, PassContext};
use crate::host::{DiskHost, HostError, ObjectStore};

/// Where an image lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Local,
    Object,
}

impl StorageBackend {
    /// Backend selected by annotation; anything but `object` is local.
    pub fn of(meta: &Meta) -> Self {
        match meta.annotation(ANNOTATION_STORAGE_BACKEND) {
            Some("object") => Self::Object,
            _ => Self::Local,
        }
    }
}

/// Node-wide storage settings from configuration.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// Root of local volumes: `<dir>/<group>/<namespace>/<id>.img`.
    pub storage_dir: PathBuf,
    /// Root of local image content: `<dir>/<group>/<id>`.
    pub image_dir: PathBuf,
    /// Object-store pool for volumes and images.
    pub object_pool: String,
    /// Size used when neither size field parses.
    pub default_volume_size: u64,
}

impl StorageSettings {
    pub fn volume_path(&self, meta: &Meta) -> PathBuf {
        self.storage_dir
            .join(&meta.group)
            .join(&meta.namespace)
            .join(format!("{}.img", meta.id))
    }

    pub fn volume_object(&self, meta: &Meta) -> String {
        format!(
            "{}/{}.{}.{}",
            self.object_pool, meta.group, meta.namespace, meta.id
        )
    }

    pub fn image_path(&self, meta: &Meta) -> PathBuf {
        self.image_dir.join(&meta.group).join(&meta.id)
    }

    pub fn image_object(&self, meta: &Meta) -> String {
        format!("{}/image.{}.{}", self.object_pool, meta.group, meta.id)
    }

    /// Bytes to allocate: LimitSize, else RequestSize, else the default.
    /// Malformed sizes are skipped.
    pub fn volume_size(&self, spec: &BlockStorageSpec) -> u64 {
        for (field, value) in [("limit_size", &spec.limit_size), ("request_size", &spec.request_size)] {
            if value.is_empty() {
                continue;
            }
            match parse_size(value) {
                Ok(size) => return size,
                Err(e) => warn!(field, value = %value, error = %e, "Ignoring malformed size"),
            }
        }
        self.default_volume_size
    }
}

/// Whether a Running VM references this volume.
pub(crate) async fn is_used(resources: &Resources, bs: &BlockStorage) -> Result<bool, ControllerError> {
    let vms = resources
        .list::<VirtualMachine>(&bs.meta.group, &bs.meta.namespace)
        .await?;
    Ok(vms.iter().any(|vm| {
        vm.status.state == VmState::Running && vm.spec.block_storage_ids.contains(&bs.meta.id)
    }))
}

pub struct BlockStorageController {
    disk: Arc<dyn DiskHost>,
    objects: Arc<dyn ObjectStore>,
    settings: StorageSettings,
}

impl BlockStorageController {
    pub fn new(
        disk: Arc<dyn DiskHost>,
        objects: Arc<dyn ObjectStore>,
        settings: StorageSettings,
    ) -> Self {
        Self {
            disk,
            objects,
            settings,
        }
    }

    /// Persist an in-flight state before a long transfer so other readers
    /// see it while the copy runs.
    async fn begin_transfer(
        ctx: &PassContext,
        bs: &mut BlockStorage,
        state: BlockStorageState,
    ) -> Result<(), ControllerError> {
        bs.status.state = state;
        ctx.resources.update(bs).await?;
        Ok(())
    }

    /// Run a transfer; on failure the volume moves to Error with the cause.
    fn finish_transfer(bs: &mut BlockStorage, result: Result<(String, u64), ControllerError>) {
        match result {
            Ok((path, size)) => {
                bs.status.path = path;
                bs.status.size_bytes = size;
                bs.status.message.clear();
                bs.status.state = BlockStorageState::Active;
            }
            Err(e) => {
                warn!(block_storage = %bs.meta.id, error = %e, "Transfer failed");
                bs.status.state = BlockStorageState::Error;
                bs.status.message = e.to_string();
            }
        }
    }

    async fn create_empty(&self, bs: &BlockStorage) -> Result<(String, u64), ControllerError> {
        let size = self.settings.volume_size(&bs.spec);
        match StorageBackend::of(&bs.meta) {
            StorageBackend::Local => {
                let path = self.settings.volume_path(&bs.meta);
                if !self.disk.image_exists(&path).await? {
                    self.disk.create_image(&path, size).await?;
                }
                Ok((path.to_string_lossy().into_owned(), size))
            }
            StorageBackend::Object => {
                let image = self.settings.volume_object(&bs.meta);
                if !self.objects.image_exists(&image).await? {
                    self.objects.create_image(&image, size).await?;
                }
                Ok((image, size))
            }
        }
    }

    async fn download(&self, bs: &BlockStorage, url: &str) -> Result<(String, u64), ControllerError> {
        match StorageBackend::of(&bs.meta) {
            StorageBackend::Local => {
                let path = self.settings.volume_path(&bs.meta);
                let size = self.disk.download(url, &path).await?;
                Ok((path.to_string_lossy().into_owned(), size))
            }
            StorageBackend::Object => {
                // Stage locally, then import.
                let staging = self
                    .settings
                    .storage_dir
                    .join(".staging")
                    .join(format!("{}.{}.{}", bs.meta.group, bs.meta.namespace, bs.meta.id));
                self.disk.download(url, &staging).await?;
                let image = self.settings.volume_object(&bs.meta);
                let imported = self.objects.import_image(&staging, &image).await;
                if let Err(e) = self.disk.remove_image(&staging).await {
                    warn!(path = %staging.display(), error = %e, "Failed to remove staging file");
                }
                imported?;
                let size = self.objects.image_size(&image).await?;
                Ok((image, size))
            }
        }
    }

    async fn copy_from_entity(
        &self,
        bs: &BlockStorage,
        entity: &ImageEntity,
    ) -> Result<(String, u64), ControllerError> {
        match (StorageBackend::of(&bs.meta), StorageBackend::of(&entity.meta)) {
            (StorageBackend::Local, StorageBackend::Local) => {
                let path = self.settings.volume_path(&bs.meta);
                let copied = self
                    .disk
                    .copy_image(Path::new(&entity.status.location), &path)
                    .await?;
                Ok((path.to_string_lossy().into_owned(), copied.size_bytes))
            }
            (StorageBackend::Object, StorageBackend::Object) => {
                let image = self.settings.volume_object(&bs.meta);
                self.objects
                    .clone_image(&entity.status.location, &image)
                    .await?;
                let size = self.objects.image_size(&image).await?;
                Ok((image, size))
            }
            _ => Err(ControllerError::Invalid(format!(
                "image entity {} is on a different storage backend",
                entity.meta.id
            ))),
        }
    }

    async fn copy_from_volume(
        &self,
        bs: &BlockStorage,
        src: &BlockStorage,
    ) -> Result<(String, u64), ControllerError> {
        match (StorageBackend::of(&bs.meta), StorageBackend::of(&src.meta)) {
            (StorageBackend::Local, StorageBackend::Local) => {
                let path = self.settings.volume_path(&bs.meta);
                let copied = self
                    .disk
                    .copy_image(Path::new(&src.status.path), &path)
                    .await?;
                Ok((path.to_string_lossy().into_owned(), copied.size_bytes))
            }
            (StorageBackend::Object, StorageBackend::Object) => {
                let image = self.settings.volume_object(&bs.meta);
                self.objects.copy_image(&src.status.path, &image).await?;
                let size = self.objects.image_size(&image).await?;
                Ok((image, size))
            }
            _ => Err(ControllerError::Invalid(format!(
                "block storage {} is on a different storage backend",
                src.meta.id
            ))),
        }
    }

    /// Resolve Image -> ImageEntity; the entity must be Available.
    async fn resolve_base_image(
        ctx: &PassContext,
        bs: &BlockStorage,
        image: &str,
    ) -> Result<ImageEntity, ControllerError> {
        let group = &bs.meta.group;
        let catalog: Image = ctx
            .resources
            .find(group, "", image)
            .await?
            .ok_or_else(|| ControllerError::Dependency(format!("image {}", image)))?;
        let entity: ImageEntity = ctx
            .resources
            .find(group, "", &catalog.spec.entity)
            .await?
            .ok_or_else(|| ControllerError::Dependency(format!("image entity {}", catalog.spec.entity)))?;
        if entity.status.state != ImageEntityState::Available {
            return Err(ControllerError::Dependency(format!(
                "image entity {} ({:?})",
                entity.meta.id, entity.status.state
            )));
        }
        Ok(entity)
    }

    async fn provision(
        &self,
        ctx: &PassContext,
        bs: &mut BlockStorage,
    ) -> Result<(), ControllerError> {
        match bs.spec.from.clone() {
            BlockStorageSource::Empty => {
                let (path, size) = self.create_empty(bs).await?;
                info!(block_storage = %bs.meta.id, path = %path, size_bytes = size, "Volume created");
                Self::finish_transfer(bs, Ok((path, size)));
            }
            BlockStorageSource::Http { url } => {
                Self::begin_transfer(ctx, bs, BlockStorageState::Downloading).await?;
                let result = self.download(bs, &url).await;
                Self::finish_transfer(bs, result);
            }
            BlockStorageSource::BaseImage { image } => {
                let entity = Self::resolve_base_image(ctx, bs, &image).await?;
                Self::begin_transfer(ctx, bs, BlockStorageState::Copying).await?;
                let result = self.copy_from_entity(bs, &entity).await;
                Self::finish_transfer(bs, result);
            }
            BlockStorageSource::BlockStorage { id } => {
                let src: BlockStorage = ctx
                    .resources
                    .find(&bs.meta.group, &bs.meta.namespace, &id)
                    .await?
                    .ok_or_else(|| ControllerError::Dependency(format!("block storage {}", id)))?;
                if !src.status.state.is_ready() {
                    return Err(ControllerError::Dependency(format!(
                        "block storage {} ({:?})",
                        id, src.status.state
                    )));
                }
                Self::begin_transfer(ctx, bs, BlockStorageState::Copying).await?;
                let result = self.copy_from_volume(bs, &src).await;
                Self::finish_transfer(bs, result);
            }
        }
        Ok(())
    }

    async fn remove_image(&self, bs: &BlockStorage) -> Result<(), HostError> {
        match StorageBackend::of(&bs.meta) {
            StorageBackend::Local => self.disk.remove_image(&self.settings.volume_path(&bs.meta)).await,
            StorageBackend::Object => {
                let image = self.settings.volume_object(&bs.meta);
                if self.objects.image_exists(&image).await? {
                    self.objects.remove_image(&image).await?;
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Controller for BlockStorageController {
    type Kind = BlockStorage;
    const NAME: &'static str = "blockstorage";

    async fn reconcile(
        &self,
        ctx: &PassContext,
        bs: &mut BlockStorage,
    ) -> Result<Outcome, ControllerError> {
        if bs.meta.is_deleting() {
            if bs.status.state != BlockStorageState::Deleting {
                bs.status.state = BlockStorageState::Deleting;
                ctx.resources.update(bs).await?;
            }
            self.remove_image(bs).await?;
            info!(block_storage = %bs.meta.id, "Volume removed");
            return Ok(Outcome::Removed);
        }

        match bs.status.state {
            BlockStorageState::Pending => self.provision(ctx, bs).await?,
            BlockStorageState::Active | BlockStorageState::Used => {}
            // In flight elsewhere, parked, or failed: leave it alone.
            _ => return Ok(Outcome::Keep),
        }

        if bs.status.state.tracks_usage() {
            bs.status.state = if is_used(&ctx.resources, bs).await? {
                BlockStorageState::Used
            } else {
                BlockStorageState::Active
            };
        }
        Ok(Outcome::Keep)
    }
}
