//! Typed repository over a [`ResourceStore`].

use std::sync::Arc;

use fleet_resources::{
    key_for, prefix_for, validate_segment, DeleteState, Group, Kind, Namespace, Scope,
};
use tracing::{debug, warn};

use crate::{ResourceStore, StoreError};

/// Typed access to resources of every kind.
///
/// Scope arguments the kind does not use are ignored, so cluster-scoped
/// kinds take `("", "", id)`.
#[derive(Clone)]
pub struct Resources {
    store: Arc<dyn ResourceStore>,
}

impl Resources {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    /// The underlying raw store.
    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    /// All resources of kind `K` in a scope.
    ///
    /// Entries that fail to decode are logged and skipped so one corrupt
    /// value cannot hide its siblings.
    pub async fn list<K: Kind>(&self, group: &str, namespace: &str) -> Result<Vec<K>, StoreError> {
        let prefix = prefix_for::<K>(group, namespace);
        let entries = self.store.list(&prefix).await?;

        let mut out = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match serde_json::from_slice::<K>(&value) {
                Ok(resource) => out.push(resource),
                Err(e) => warn!(key = %key, error = %e, "Skipping undecodable resource"),
            }
        }
        Ok(out)
    }

    /// All resources of kind `K` across the cluster, walking
    /// Group -> Namespace as the kind's scope requires.
    ///
    /// A failure below the group level is logged and that scope skipped.
    pub async fn list_all<K: Kind>(&self) -> Result<Vec<K>, StoreError> {
        if K::SCOPE == Scope::Cluster {
            return self.list::<K>("", "").await;
        }

        let mut out = Vec::new();
        for group in self.list::<Group>("", "").await? {
            let group_id = &group.meta.id;
            if K::SCOPE == Scope::Group {
                match self.list::<K>(group_id, "").await {
                    Ok(items) => out.extend(items),
                    Err(e) => warn!(group = %group_id, kind = K::KIND, error = %e, "List failed"),
                }
                continue;
            }

            let namespaces = match self.list::<Namespace>(group_id, "").await {
                Ok(namespaces) => namespaces,
                Err(e) => {
                    warn!(group = %group_id, error = %e, "Namespace list failed");
                    continue;
                }
            };
            for ns in namespaces {
                match self.list::<K>(group_id, &ns.meta.id).await {
                    Ok(items) => out.extend(items),
                    Err(e) => warn!(
                        group = %group_id,
                        namespace = %ns.meta.id,
                        kind = K::KIND,
                        error = %e,
                        "List failed"
                    ),
                }
            }
        }
        Ok(out)
    }

    /// A single resource, or [`StoreError::NotFound`].
    pub async fn get<K: Kind>(&self, group: &str, namespace: &str, id: &str) -> Result<K, StoreError> {
        let key = key_for::<K>(group, namespace, id);
        let value = self.store.get(&key).await?;
        Ok(serde_json::from_slice(&value)?)
    }

    /// A single resource, or `None` if absent.
    pub async fn find<K: Kind>(
        &self,
        group: &str,
        namespace: &str,
        id: &str,
    ) -> Result<Option<K>, StoreError> {
        match self.get(group, namespace, id).await {
            Ok(resource) => Ok(Some(resource)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Store a new resource, stamping its hash. Rejects duplicates.
    pub async fn create<K: Kind>(&self, resource: &mut K) -> Result<(), StoreError> {
        validate_scope(resource)?;
        let key = resource.key();
        let _guard = self.store.lock(&key).await;

        match self.store.get(&key).await {
            Ok(_) => return Err(StoreError::AlreadyExists(key)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        if resource.meta().name.is_empty() {
            let id = resource.meta().id.clone();
            resource.meta_mut().name = id;
        }
        resource.stamp_hash()?;
        self.store.put(&key, serde_json::to_vec(resource)?).await?;

        debug!(key = %key, "Created resource");
        Ok(())
    }

    /// Overwrite an existing resource, stamping its hash.
    ///
    /// Fails with [`StoreError::NotFound`] if the resource was removed in
    /// the meantime, so a late write never resurrects it.
    pub async fn update<K: Kind>(&self, resource: &mut K) -> Result<(), StoreError> {
        let key = resource.key();
        let _guard = self.store.lock(&key).await;

        let current: K = serde_json::from_slice(&self.store.get(&key).await?)?;
        if current.meta().name != resource.meta().name {
            return Err(StoreError::ImmutableField { key, field: "name" });
        }

        resource.stamp_hash()?;
        self.store.put(&key, serde_json::to_vec(resource)?).await?;
        Ok(())
    }

    /// Mark a resource for deletion. Already-deleting resources are left as
    /// they are.
    pub async fn delete_state<K: Kind>(
        &self,
        group: &str,
        namespace: &str,
        id: &str,
    ) -> Result<(), StoreError> {
        let key = key_for::<K>(group, namespace, id);
        let _guard = self.store.lock(&key).await;

        let mut resource: K = serde_json::from_slice(&self.store.get(&key).await?)?;
        if resource.meta().is_deleting() {
            return Ok(());
        }

        resource.meta_mut().delete_state = DeleteState::Deleting;
        resource.stamp_hash()?;
        self.store.put(&key, serde_json::to_vec(&resource)?).await?;

        debug!(key = %key, "Marked resource for deletion");
        Ok(())
    }

    /// Remove a resource from the store.
    pub async fn remove<K: Kind>(&self, group: &str, namespace: &str, id: &str) -> Result<(), StoreError> {
        let key = key_for::<K>(group, namespace, id);
        let _guard = self.store.lock(&key).await;
        self.store.delete(&key).await?;

        debug!(key = %key, "Removed resource");
        Ok(())
    }
}

fn validate_scope<K: Kind>(resource: &K) -> Result<(), StoreError> {
    let meta = resource.meta();
    validate_segment(&meta.id)?;
    match K::SCOPE {
        Scope::Cluster => {}
        Scope::Group => validate_segment(&meta.group)?,
        Scope::Namespace => {
            validate_segment(&meta.group)?;
            validate_segment(&meta.namespace)?;
        }
    }
    Ok(())
}
