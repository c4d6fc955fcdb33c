//! The `Kind` trait and key layout.

use fleet_reconcile::ResourceHash;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Meta, ResourceError};

/// JSON pointer of the hash field blanked before hashing.
pub const HASH_POINTER: &str = "/meta/resource_hash";

/// Where a kind lives in the key hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// `<kind>/<id>`
    Cluster,
    /// `<kind>/<group>/<id>`
    Group,
    /// `<kind>/<group>/<namespace>/<id>`
    Namespace,
}

/// A typed resource kind.
pub trait Kind: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Kind discriminator; also the first key segment.
    const KIND: &'static str;

    /// Scope of the kind in the key hierarchy.
    const SCOPE: Scope;

    /// The common envelope.
    fn meta(&self) -> &Meta;

    /// Mutable access to the common envelope.
    fn meta_mut(&mut self) -> &mut Meta;

    /// The store key of this resource.
    fn key(&self) -> String {
        let meta = self.meta();
        key_for::<Self>(&meta.group, &meta.namespace, &meta.id)
    }

    /// Digest over the resource with its hash field blanked.
    fn content_hash(&self) -> Result<ResourceHash, serde_json::Error> {
        ResourceHash::of(self, HASH_POINTER)
    }

    /// Recompute and store the resource hash, returning it.
    fn stamp_hash(&mut self) -> Result<ResourceHash, serde_json::Error> {
        let hash = self.content_hash()?;
        self.meta_mut().resource_hash = hash.as_str().to_string();
        Ok(hash)
    }
}

/// Build the key for a resource of kind `K`. Scoping keys the kind does not
/// use are ignored.
pub fn key_for<K: Kind>(group: &str, namespace: &str, id: &str) -> String {
    format!("{}{}", prefix_for::<K>(group, namespace), id)
}

/// Build the list prefix for kind `K` within a scope.
pub fn prefix_for<K: Kind>(group: &str, namespace: &str) -> String {
    match K::SCOPE {
        Scope::Cluster => format!("{}/", K::KIND),
        Scope::Group => format!("{}/{}/", K::KIND, group),
        Scope::Namespace => format!("{}/{}/{}/", K::KIND, group, namespace),
    }
}

/// Reject key segments that would break the key layout.
pub fn validate_segment(segment: &str) -> Result<(), ResourceError> {
    if segment.is_empty() {
        return Err(ResourceError::InvalidKey {
            segment: segment.to_string(),
            reason: "must not be empty",
        });
    }
    if segment.contains('/') {
        return Err(ResourceError::InvalidKey {
            segment: segment.to_string(),
            reason: "must not contain '/'",
        });
    }
    Ok(())
}
