//! Resource kinds, their specs, and their states.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{define_kind, LogEntry, Scope};

// ============================================================================
// Containers
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSpec {
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStatus {}

define_kind!(
    /// Top-level scoping container. Removed once no Namespace references it.
    Group, "group", Scope::Cluster, GroupSpec, GroupStatus
);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSpec {
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceStatus {}

define_kind!(
    /// Scoping container inside a Group. Removed once it has no children.
    Namespace, "namespace", Scope::Group, NamespaceSpec, NamespaceStatus
);

// ============================================================================
// Networks
// ============================================================================

/// State shared by Network and NodeNetwork.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkState {
    #[default]
    Pending,
    Available,
    Deleting,
}

/// Per-node template copied onto every NodeNetwork.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTemplate {
    /// Annotations (backend selector, gateway, VLAN device...).
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Numeric network ID; doubles as VLAN ID / VNI.
    pub id: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_cidr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_cidr: Option<String>,

    #[serde(default)]
    pub template: NodeTemplate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    #[serde(default)]
    pub state: NetworkState,

    /// Nodes whose NodeNetwork is Available, sorted.
    #[serde(default)]
    pub nodes: Vec<String>,
}

define_kind!(
    /// Cluster-logical network, materialized as one NodeNetwork per node.
    Network, "network", Scope::Namespace, NetworkSpec, NetworkStatus
);

/// A network interface attached to a VM or router.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nic {
    /// Logical Network id in the same namespace.
    pub network: String,

    /// Address with prefix, e.g. `10.0.1.1/24`.
    #[serde(default)]
    pub address: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeNetworkSpec {
    /// Parent Network id.
    pub network: String,

    /// Numeric network ID copied from the parent.
    pub id: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_cidr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_cidr: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeNetworkStatus {
    #[serde(default)]
    pub state: NetworkState,

    #[serde(default)]
    pub logs: Vec<LogEntry>,

    /// Derived: `<kind>/<id>/<nic index>` of running owners -> NIC.
    /// Never an input to the state machine.
    #[serde(default)]
    pub attached_interfaces: BTreeMap<String, Nic>,
}

define_kind!(
    /// Per-node materialization of a Network.
    NodeNetwork, "nodenetwork", Scope::Namespace, NodeNetworkSpec, NodeNetworkStatus
);

// ============================================================================
// Storage
// ============================================================================

/// Where a BlockStorage's initial content comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BlockStorageSource {
    /// Zero-filled image.
    #[default]
    Empty,

    /// Download from a URL.
    #[serde(rename = "HTTP")]
    Http { url: String },

    /// Copy the ImageEntity behind a group Image.
    BaseImage { image: String },

    /// Copy another BlockStorage in the same namespace.
    BlockStorage { id: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStorageState {
    #[default]
    Pending,
    Active,
    Used,
    Copying,
    Downloading,
    Deleting,
    Reserved,
    Error,
}

impl BlockStorageState {
    /// Whether Active/Used may be recomputed from VM references.
    ///
    /// In-flight transitions (and Reserved/Error) own the state until they
    /// finish.
    pub fn tracks_usage(&self) -> bool {
        matches!(self, Self::Active | Self::Used)
    }

    /// Whether the image exists and can be attached or copied.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Active | Self::Used)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStorageSpec {
    #[serde(default)]
    pub request_size: String,

    #[serde(default)]
    pub limit_size: String,

    #[serde(default)]
    pub from: BlockStorageSource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStorageStatus {
    #[serde(default)]
    pub state: BlockStorageState,

    /// Local path or `pool/image` of the backing image.
    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub size_bytes: u64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

define_kind!(
    /// A disk image on a node (local file) or in the object store.
    BlockStorage, "blockstorage", Scope::Namespace, BlockStorageSpec, BlockStorageStatus
);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    /// ImageEntity id in the same group.
    pub entity: String,

    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageStatus {}

define_kind!(
    /// Named catalog entry pointing at an ImageEntity.
    Image, "image", Scope::Group, ImageSpec, ImageStatus
);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSource {
    pub namespace: String,
    pub block_storage_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageEntityState {
    #[default]
    Pending,
    Copying,
    Available,
    Deleting,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEntitySpec {
    /// Content digest, recorded once a local copy completes.
    #[serde(default)]
    pub hash: String,

    pub source: ImageSource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEntityStatus {
    #[serde(default)]
    pub state: ImageEntityState,

    /// Content file path, or `pool/image@snapshot` in the object store.
    #[serde(default)]
    pub location: String,

    #[serde(default)]
    pub size_bytes: u64,
}

define_kind!(
    /// Immutable image content captured from a BlockStorage.
    ImageEntity, "imageentity", Scope::Group, ImageEntitySpec, ImageEntityStatus
);

// ============================================================================
// Compute
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionState {
    PowerOn,
    #[default]
    PowerOff,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmState {
    #[default]
    Pending,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineSpec {
    pub uuid: Uuid,

    pub vcpus: u32,

    pub memory_mib: u64,

    #[serde(default)]
    pub block_storage_ids: Vec<String>,

    #[serde(default)]
    pub nics: Vec<Nic>,

    #[serde(default)]
    pub action_state: ActionState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineStatus {
    #[serde(default)]
    pub state: VmState,
}

define_kind!(
    /// A hypervisor process on one node.
    VirtualMachine, "virtualmachine", Scope::Namespace, VirtualMachineSpec, VirtualMachineStatus
);

// ============================================================================
// Routers
// ============================================================================

/// Source NAT: traffic from `source` leaves with `translated` as source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatRule {
    pub source: String,
    pub translated: String,
}

/// Destination NAT: `external_port` on the router maps to an internal
/// address and port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnatRule {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub external_port: u16,
    pub internal_address: String,
    pub internal_port: u16,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouterState {
    #[default]
    Pending,
    Running,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualRouterSpec {
    pub external_gateway: String,

    /// External address with prefix, e.g. `192.0.2.10/24`.
    pub external_ip: String,

    #[serde(default)]
    pub nics: Vec<Nic>,

    #[serde(default)]
    pub nat_rules: Vec<NatRule>,

    #[serde(default)]
    pub dnat_rules: Vec<DnatRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualRouterStatus {
    #[serde(default)]
    pub state: RouterState,

    /// Network namespace holding the routing domain.
    #[serde(default)]
    pub netns: String,

    /// Inside address applied to each veth port, keyed by port name.
    #[serde(default)]
    pub addresses: BTreeMap<String, String>,

    /// NAT rules installed in the namespace, one `table chain args` line each.
    #[serde(default)]
    pub rules: Vec<String>,
}

define_kind!(
    /// An isolated routing domain built from a kernel network namespace.
    VirtualRouter, "virtualrouter", Scope::Namespace, VirtualRouterSpec, VirtualRouterStatus
);

// ============================================================================
// Nodes
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    #[default]
    NotReady,
    Ready,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub limit_vcpus: u32,
    pub limit_memory_mib: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub state: NodeState,

    #[serde(default)]
    pub allocated_vcpus: u32,

    #[serde(default)]
    pub allocated_memory_mib: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

define_kind!(
    /// A hypervisor host running an agent.
    Node, "node", Scope::Cluster, NodeSpec, NodeStatus
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Kind, Meta};

    #[test]
    fn test_block_storage_source_tagging() {
        let src = BlockStorageSource::Http {
            url: "http://example.invalid/disk.img".to_string(),
        };
        let json = serde_json::to_value(&src).unwrap();
        assert_eq!(json["type"], "HTTP");

        let empty: BlockStorageSource = serde_json::from_str(r#"{"type":"Empty"}"#).unwrap();
        assert_eq!(empty, BlockStorageSource::Empty);

        let copy: BlockStorageSource =
            serde_json::from_str(r#"{"type":"BlockStorage","id":"bs0"}"#).unwrap();
        assert_eq!(
            copy,
            BlockStorageSource::BlockStorage {
                id: "bs0".to_string()
            }
        );
    }

    #[test]
    fn test_states_serialize_by_name() {
        assert_eq!(
            serde_json::to_string(&BlockStorageState::Downloading).unwrap(),
            "\"Downloading\""
        );
        assert_eq!(serde_json::to_string(&ActionState::PowerOn).unwrap(), "\"PowerOn\"");
    }

    #[test]
    fn test_usage_tracking_states() {
        assert!(BlockStorageState::Active.tracks_usage());
        assert!(BlockStorageState::Used.tracks_usage());
        for state in [
            BlockStorageState::Pending,
            BlockStorageState::Copying,
            BlockStorageState::Downloading,
            BlockStorageState::Deleting,
            BlockStorageState::Reserved,
            BlockStorageState::Error,
        ] {
            assert!(!state.tracks_usage(), "{:?}", state);
        }
    }

    #[test]
    fn test_resource_roundtrip_through_store_json() {
        let vm = VirtualMachine::new(
            Meta::namespaced("g1", "ns1", "vm1").with_node("node-a"),
            VirtualMachineSpec {
                uuid: Uuid::nil(),
                vcpus: 2,
                memory_mib: 2048,
                block_storage_ids: vec!["bs1".to_string()],
                nics: vec![],
                action_state: ActionState::PowerOn,
            },
        );
        let bytes = serde_json::to_vec(&vm).unwrap();
        let parsed: VirtualMachine = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, vm);
        assert_eq!(parsed.key(), "virtualmachine/g1/ns1/vm1");
    }

    #[test]
    fn test_dnat_protocol_defaults_to_tcp() {
        let rule: DnatRule = serde_json::from_str(
            r#"{"external_port":8080,"internal_address":"10.0.1.5","internal_port":80}"#,
        )
        .unwrap();
        assert_eq!(rule.protocol, "tcp");
    }
}
