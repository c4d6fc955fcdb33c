//! ImageEntity lifecycle: capture a ready BlockStorage as immutable image
//! content that new volumes can be copied or cloned from.
//!
//! Local entities are plain files under the image directory and record the
//! content digest in `spec.hash`. Object entities are an image with a
//! protected `base` snapshot; their location is that snapshot.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use fleet_resources::{BlockStorage, ImageEntity, ImageEntityState};
use tracing::{info, warn};

use crate::engine::{Controller, ControllerError, Outcome, PassContext};
use crate::host::{DiskHost, HostError, ObjectStore};
use crate::storage::{StorageBackend, StorageSettings};

const BASE_SNAPSHOT: &str = "base";

pub struct ImageEntityController {
    disk: Arc<dyn DiskHost>,
    objects: Arc<dyn ObjectStore>,
    settings: StorageSettings,
}

impl ImageEntityController {
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

    async fn source(
        ctx: &PassContext,
        entity: &ImageEntity,
    ) -> Result<BlockStorage, ControllerError> {
        let source = &entity.spec.source;
        let bs: BlockStorage = ctx
            .resources
            .find(&entity.meta.group, &source.namespace, &source.block_storage_id)
            .await?
            .ok_or_else(|| {
                ControllerError::Dependency(format!("block storage {}", source.block_storage_id))
            })?;
        if !bs.status.state.is_ready() {
            return Err(ControllerError::Dependency(format!(
                "block storage {} ({:?})",
                bs.meta.id, bs.status.state
            )));
        }
        if StorageBackend::of(&bs.meta) != StorageBackend::of(&entity.meta) {
            return Err(ControllerError::Invalid(format!(
                "block storage {} is on a different storage backend",
                bs.meta.id
            )));
        }
        Ok(bs)
    }

    async fn capture(
        &self,
        entity: &mut ImageEntity,
        bs: &BlockStorage,
    ) -> Result<(), HostError> {
        match StorageBackend::of(&entity.meta) {
            StorageBackend::Local => {
                let path = self.settings.image_path(&entity.meta);
                let copied = self
                    .disk
                    .copy_image(Path::new(&bs.status.path), &path)
                    .await?;
                entity.spec.hash = copied.sha256;
                entity.status.location = path.to_string_lossy().into_owned();
                entity.status.size_bytes = copied.size_bytes;
            }
            StorageBackend::Object => {
                let image = self.settings.image_object(&entity.meta);
                if !self.objects.image_exists(&image).await? {
                    self.objects.copy_image(&bs.status.path, &image).await?;
                }
                let snapshots = self.objects.list_snapshots(&image).await?;
                if !snapshots.iter().any(|s| s == BASE_SNAPSHOT) {
                    self.objects.create_snapshot(&image, BASE_SNAPSHOT).await?;
                }
                self.objects.protect_snapshot(&image, BASE_SNAPSHOT).await?;
                entity.status.size_bytes = self.objects.image_size(&image).await?;
                entity.status.location = format!("{}@{}", image, BASE_SNAPSHOT);
            }
        }
        Ok(())
    }

    async fn discard(&self, entity: &ImageEntity) -> Result<(), HostError> {
        match StorageBackend::of(&entity.meta) {
            StorageBackend::Local => {
                self.disk
                    .remove_image(&self.settings.image_path(&entity.meta))
                    .await
            }
            StorageBackend::Object => {
                let image = self.settings.image_object(&entity.meta);
                if !self.objects.image_exists(&image).await? {
                    return Ok(());
                }
                // Fails while volumes cloned from the snapshot still exist.
                for snap in self.objects.list_snapshots(&image).await? {
                    self.objects.unprotect_snapshot(&image, &snap).await?;
                    self.objects.remove_snapshot(&image, &snap).await?;
                }
                self.objects.remove_image(&image).await
            }
        }
    }
}

#[async_trait]
impl Controller for ImageEntityController {
    type Kind = ImageEntity;
    const NAME: &'static str = "imageentity";

    async fn reconcile(
        &self,
        ctx: &PassContext,
        entity: &mut ImageEntity,
    ) -> Result<Outcome, ControllerError> {
        if entity.meta.is_deleting() {
            if entity.status.state != ImageEntityState::Deleting {
                entity.status.state = ImageEntityState::Deleting;
                ctx.resources.update(entity).await?;
            }
            self.discard(entity).await?;
            info!(image_entity = %entity.meta.id, "Image content removed");
            return Ok(Outcome::Removed);
        }

        if entity.status.state != ImageEntityState::Pending {
            return Ok(Outcome::Keep);
        }

        let bs = Self::source(ctx, entity).await?;

        entity.status.state = ImageEntityState::Copying;
        ctx.resources.update(entity).await?;

        if let Err(e) = self.capture(entity, &bs).await {
            warn!(image_entity = %entity.meta.id, error = %e, "Image capture failed");
            // Unchanged from list time as far as the engine can tell, so
            // persist the rollback here.
            entity.status.state = ImageEntityState::Pending;
            ctx.resources.update(entity).await?;
            return Err(e.into());
        }

        info!(
            image_entity = %entity.meta.id,
            location = %entity.status.location,
            size_bytes = entity.status.size_bytes,
            "Image available"
        );
        entity.status.state = ImageEntityState::Available;
        Ok(Outcome::Keep)
    }
}
