//! The common resource envelope and well-known annotations.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Node-affinity annotation: the one node permitted to mutate the resource.
pub const ANNOTATION_NODE: &str = "fleet.io/node";

/// Network backend selector: `bridge` (default), `vlan`, or `vxlan`.
pub const ANNOTATION_NETWORK_BACKEND: &str = "fleet.io/network-backend";

/// Address/prefix assigned to a network's bridge, enabling masquerade.
pub const ANNOTATION_DEFAULT_GATEWAY: &str = "fleet.io/default-gateway";

/// Physical device override for VLAN sub-interfaces.
pub const ANNOTATION_VLAN_DEVICE: &str = "fleet.io/vlan-device";

/// Bridge device name, written by the network provisioner.
pub const ANNOTATION_BRIDGE: &str = "fleet.io/bridge";

/// VLAN sub-interface name, written by the network provisioner.
pub const ANNOTATION_VLAN_INTERFACE: &str = "fleet.io/vlan-interface";

/// VXLAN device name, written by the network provisioner.
pub const ANNOTATION_VXLAN_INTERFACE: &str = "fleet.io/vxlan-interface";

/// Storage backend selector: `local` (default) or `object`.
pub const ANNOTATION_STORAGE_BACKEND: &str = "fleet.io/storage-backend";

/// External bridge override for a virtual router.
pub const ANNOTATION_EXTERNAL_BRIDGE: &str = "fleet.io/external-bridge";

/// Deletion marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteState {
    /// Live resource.
    #[default]
    #[serde(rename = "")]
    None,

    /// Deletion requested; the owner tears down and then removes it.
    Deleting,
}

/// Common envelope carried by every resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// Identifier, unique within the scope.
    pub id: String,

    /// Display name. Immutable once created.
    #[serde(default)]
    pub name: String,

    /// Owning group (empty for cluster-scoped kinds).
    #[serde(default)]
    pub group: String,

    /// Owning namespace (empty unless namespace-scoped).
    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub delete_state: DeleteState,

    /// Digest over the resource with this field blanked.
    #[serde(default)]
    pub resource_hash: String,
}

impl Meta {
    /// Envelope for a cluster-scoped resource.
    pub fn cluster(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            ..Default::default()
        }
    }

    /// Envelope for a group-scoped resource.
    pub fn grouped(group: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            ..Self::cluster(id)
        }
    }

    /// Envelope for a namespace-scoped resource.
    pub fn namespaced(
        group: impl Into<String>,
        namespace: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::grouped(group, id)
        }
    }

    /// Set an annotation.
    #[must_use]
    pub fn with_annotation(mut self, key: &str, value: impl Into<String>) -> Self {
        self.annotations.insert(key.to_string(), value.into());
        self
    }

    /// Pin the resource to a node.
    #[must_use]
    pub fn with_node(self, node: impl Into<String>) -> Self {
        self.with_annotation(ANNOTATION_NODE, node)
    }

    /// Look up an annotation, treating an empty value as absent.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// The node this resource is pinned to, if any.
    pub fn node_affinity(&self) -> Option<&str> {
        self.annotation(ANNOTATION_NODE)
    }

    pub fn is_deleting(&self) -> bool {
        self.delete_state == DeleteState::Deleting
    }
}

/// A diagnostic appended to a resource's status by the node that hit it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub node: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl LogEntry {
    pub fn new(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            timestamp: Utc::now(),
            message: message.into(),
        }
    }
}

/// Append `entry` unless the newest entry already carries the same node and
/// message. Returns true if appended.
pub fn push_log(logs: &mut Vec<LogEntry>, entry: LogEntry) -> bool {
    if let Some(last) = logs.last() {
        if last.node == entry.node && last.message == entry.message {
            return false;
        }
    }
    logs.push(entry);
    true
}
