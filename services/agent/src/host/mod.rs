//! Node-local collaborators the controllers drive.
//!
//! Each concern is a trait so controllers can be exercised against the
//! in-memory fakes in [`fake`] instead of the real kernel and tools:
//!
//! - [`NetworkHost`]: links, bridges, VLAN/VXLAN, veth, netns, addresses,
//!   routes, forwarding, and iptables rules (`ip`, `iptables`)
//! - [`DiskHost`]: local disk images (`qemu-img`, files, HTTP downloads)
//! - [`ObjectStore`]: block images and snapshots in an object pool (`rbd`)
//! - [`Hypervisor`]: VM processes keyed by UUID (`qemu-system-x86_64`)

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

mod disk;
mod exec;
pub mod fake;
mod hypervisor;
mod net;
mod object;

pub use disk::LocalDiskHost;
pub use hypervisor::QemuHypervisor;
pub use net::ExecNetworkHost;
pub use object::RbdObjectStore;

/// Errors from host operations.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("download failed: {0}")]
    Download(String),

    #[error("unexpected output from {command}: {detail}")]
    Parse { command: String, detail: String },

    #[error("{0} not found")]
    NotFound(String),
}

/// An iptables rule: table, chain, and match/target arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub table: String,
    pub chain: String,
    pub args: Vec<String>,
}

impl FirewallRule {
    fn nat(chain: &str, args: Vec<String>) -> Self {
        Self {
            table: "nat".to_string(),
            chain: chain.to_string(),
            args,
        }
    }

    /// Single-line form, `<table> <chain> <args...>`.
    pub fn to_line(&self) -> String {
        let mut line = format!("{} {}", self.table, self.chain);
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Parse a line written by [`FirewallRule::to_line`].
    pub fn from_line(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let table = fields.next()?.to_string();
        let chain = fields.next()?.to_string();
        Some(Self {
            table,
            chain,
            args: fields.map(str::to_string).collect(),
        })
    }

    /// Masquerade traffic from `source` leaving through any interface other
    /// than `bridge`.
    pub fn masquerade_from_bridge(source: &str, bridge: &str) -> Self {
        Self::nat(
            "POSTROUTING",
            strings(&["-s", source, "!", "-o", bridge, "-j", "MASQUERADE"]),
        )
    }

    /// Masquerade traffic from `source` leaving through `out_iface`.
    pub fn masquerade_out(source: &str, out_iface: &str) -> Self {
        Self::nat(
            "POSTROUTING",
            strings(&["-s", source, "-o", out_iface, "-j", "MASQUERADE"]),
        )
    }

    /// Rewrite the source of traffic from `source` leaving `out_iface`.
    pub fn snat(source: &str, out_iface: &str, translated: &str) -> Self {
        Self::nat(
            "POSTROUTING",
            strings(&[
                "-s",
                source,
                "-o",
                out_iface,
                "-j",
                "SNAT",
                "--to-source",
                translated,
            ]),
        )
    }

    /// Map `external_port` arriving on `in_iface` to an internal endpoint.
    pub fn dnat(
        in_iface: &str,
        protocol: &str,
        external_port: u16,
        internal_address: &str,
        internal_port: u16,
    ) -> Self {
        Self::nat(
            "PREROUTING",
            strings(&[
                "-i",
                in_iface,
                "-p",
                protocol,
                "--dport",
                &external_port.to_string(),
                "-j",
                "DNAT",
                "--to-destination",
                &format!("{}:{}", internal_address, internal_port),
            ]),
        )
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Kernel networking on this node. `netns: None` means the root namespace.
#[async_trait]
pub trait NetworkHost: Send + Sync {
    async fn link_exists(&self, netns: Option<&str>, name: &str) -> Result<bool, HostError>;

    /// The bridge a link is enslaved to, if any.
    async fn link_master(&self, name: &str) -> Result<Option<String>, HostError>;

    /// Create a bridge and bring it up.
    async fn create_bridge(&self, name: &str) -> Result<(), HostError>;

    /// Create `<parent>.<vlan_id>` as `name`.
    async fn create_vlan(&self, name: &str, parent: &str, vlan_id: u32) -> Result<(), HostError>;

    /// Create a VXLAN device bound to a multicast group on `device`.
    async fn create_vxlan(
        &self,
        name: &str,
        vni: u32,
        group: &str,
        device: &str,
    ) -> Result<(), HostError>;

    /// Create a veth pair in the root namespace.
    async fn create_veth(&self, outside: &str, inside: &str) -> Result<(), HostError>;

    async fn set_master(&self, name: &str, bridge: &str) -> Result<(), HostError>;

    async fn set_up(&self, netns: Option<&str>, name: &str) -> Result<(), HostError>;

    async fn delete_link(&self, name: &str) -> Result<(), HostError>;

    async fn has_address(&self, netns: Option<&str>, name: &str, cidr: &str)
        -> Result<bool, HostError>;

    async fn add_address(&self, netns: Option<&str>, name: &str, cidr: &str)
        -> Result<(), HostError>;

    async fn delete_address(&self, netns: Option<&str>, name: &str, cidr: &str)
        -> Result<(), HostError>;

    async fn netns_exists(&self, name: &str) -> Result<bool, HostError>;

    async fn create_netns(&self, name: &str) -> Result<(), HostError>;

    async fn delete_netns(&self, name: &str) -> Result<(), HostError>;

    /// Move a root-namespace link into `netns`.
    async fn move_to_netns(&self, name: &str, netns: &str) -> Result<(), HostError>;

    async fn default_route(&self, netns: &str) -> Result<Option<String>, HostError>;

    async fn set_default_route(&self, netns: &str, gateway: &str) -> Result<(), HostError>;

    async fn forwarding_enabled(&self, netns: &str) -> Result<bool, HostError>;

    async fn enable_forwarding(&self, netns: &str) -> Result<(), HostError>;

    async fn rule_exists(&self, netns: Option<&str>, rule: &FirewallRule)
        -> Result<bool, HostError>;

    async fn append_rule(&self, netns: Option<&str>, rule: &FirewallRule)
        -> Result<(), HostError>;

    async fn delete_rule(&self, netns: Option<&str>, rule: &FirewallRule)
        -> Result<(), HostError>;
}

/// Result of a digesting copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyResult {
    pub size_bytes: u64,
    /// Lowercase hex sha256 of the copied bytes.
    pub sha256: String,
}

/// Local disk images.
#[async_trait]
pub trait DiskHost: Send + Sync {
    async fn image_exists(&self, path: &Path) -> Result<bool, HostError>;

    /// Create a zero-filled raw image, creating parent directories.
    async fn create_image(&self, path: &Path, size_bytes: u64) -> Result<(), HostError>;

    async fn image_size(&self, path: &Path) -> Result<u64, HostError>;

    /// Copy `src` to `dst`, digesting the bytes on the way.
    async fn copy_image(&self, src: &Path, dst: &Path) -> Result<CopyResult, HostError>;

    /// Download `url` into `dst`, returning the byte count.
    async fn download(&self, url: &str, dst: &Path) -> Result<u64, HostError>;

    /// Remove an image. Removing an absent image succeeds.
    async fn remove_image(&self, path: &Path) -> Result<(), HostError>;
}

/// Images and snapshots in an object-store pool. Images are named
/// `pool/name`, snapshots `pool/name@snap`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool, HostError>;

    async fn create_image(&self, image: &str, size_bytes: u64) -> Result<(), HostError>;

    async fn image_size(&self, image: &str) -> Result<u64, HostError>;

    async fn copy_image(&self, src: &str, dst: &str) -> Result<(), HostError>;

    /// Clone a protected snapshot into a new image.
    async fn clone_image(&self, snapshot: &str, dst: &str) -> Result<(), HostError>;

    /// Import a local file as a new image.
    async fn import_image(&self, src: &Path, image: &str) -> Result<(), HostError>;

    async fn remove_image(&self, image: &str) -> Result<(), HostError>;

    async fn list_snapshots(&self, image: &str) -> Result<Vec<String>, HostError>;

    async fn create_snapshot(&self, image: &str, snap: &str) -> Result<(), HostError>;

    async fn protect_snapshot(&self, image: &str, snap: &str) -> Result<(), HostError>;

    async fn unprotect_snapshot(&self, image: &str, snap: &str) -> Result<(), HostError>;

    async fn remove_snapshot(&self, image: &str, snap: &str) -> Result<(), HostError>;
}

/// A disk attached to a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmDisk {
    /// Raw image file on this node.
    Local(String),
    /// `pool/image` in the object store.
    Object(String),
}

/// A NIC attached to a VM: the host bridge and the guest MAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmNic {
    pub bridge: String,
    pub mac: String,
}

/// Everything needed to start a VM process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmLaunch {
    pub uuid: Uuid,
    pub name: String,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub disks: Vec<VmDisk>,
    pub nics: Vec<VmNic>,
}

/// VM processes on this node.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn start(&self, launch: &VmLaunch) -> Result<(), HostError>;

    /// Ask the VM process to exit. Stopping an absent VM succeeds.
    async fn stop(&self, uuid: Uuid) -> Result<(), HostError>;

    async fn is_running(&self, uuid: Uuid) -> Result<bool, HostError>;
}
