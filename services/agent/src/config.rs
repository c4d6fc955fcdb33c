//! Configuration for the agent.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fleet_reconcile::DEFAULT_RECONCILE_INTERVAL;
use fleet_resources::{parse_size, NodeSpec, GIB, MIB};

use crate::heartbeat::DEFAULT_HEARTBEAT_PERIOD;
use crate::network::NetworkSettings;
use crate::storage::StorageSettings;

/// A controller loop the agent can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ControllerKind {
    Group,
    Namespace,
    Network,
    NodeNetwork,
    VirtualRouter,
    BlockStorage,
    ImageEntity,
    VirtualMachine,
    Node,
}

impl ControllerKind {
    /// Controllers that act on resources pinned to this node.
    pub const NODE_LOCAL: [ControllerKind; 6] = [
        Self::NodeNetwork,
        Self::VirtualRouter,
        Self::BlockStorage,
        Self::ImageEntity,
        Self::VirtualMachine,
        Self::Node,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Namespace => "namespace",
            Self::Network => "network",
            Self::NodeNetwork => "nodenetwork",
            Self::VirtualRouter => "virtualrouter",
            Self::BlockStorage => "blockstorage",
            Self::ImageEntity => "imageentity",
            Self::VirtualMachine => "virtualmachine",
            Self::Node => "node",
        }
    }
}

impl FromStr for ControllerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "group" => Self::Group,
            "namespace" => Self::Namespace,
            "network" => Self::Network,
            "nodenetwork" => Self::NodeNetwork,
            "virtualrouter" => Self::VirtualRouter,
            "blockstorage" => Self::BlockStorage,
            "imageentity" => Self::ImageEntity,
            "virtualmachine" => Self::VirtualMachine,
            "node" => Self::Node,
            other => bail!("unknown controller: {}", other),
        })
    }
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// This node's name; resources pinned to it are ours.
    pub node_name: String,

    /// SQLite database holding the resource store.
    pub store_path: PathBuf,

    /// Time between reconcile passes.
    pub reconcile_interval: Duration,

    /// Controller loops to run.
    pub controllers: BTreeSet<ControllerKind>,

    pub storage: StorageSettings,

    pub network: NetworkSettings,

    /// Bridge routers attach their external port to by default.
    pub external_bridge: String,

    /// Capacity advertised on this node's Node resource.
    pub node_limits: NodeSpec,

    /// How often an unchanged Node is rewritten.
    pub heartbeat_period: Duration,

    pub qemu_path: String,

    /// Pidfiles for VM processes.
    pub run_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let hostname = std::fs::read_to_string("/proc/sys/kernel/hostname")
            .ok()
            .map(|s| s.trim().to_string());
        Self::from_lookup(|key| std::env::var(key).ok(), hostname)
    }

    /// Build configuration from a variable lookup and the kernel hostname.
    pub fn from_lookup<F>(lookup: F, hostname: Option<String>) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let or = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let node_name = var("FLEET_NODE_NAME")
            .or(hostname.filter(|h| !h.is_empty()))
            .context("FLEET_NODE_NAME is unset and the kernel hostname is unavailable")?;

        let reconcile_interval = match var("FLEET_RECONCILE_INTERVAL_MS") {
            Some(ms) => Duration::from_millis(
                ms.parse()
                    .with_context(|| format!("invalid FLEET_RECONCILE_INTERVAL_MS: {}", ms))?,
            ),
            None => DEFAULT_RECONCILE_INTERVAL,
        };

        let controllers = match var("FLEET_CONTROLLERS") {
            Some(list) => list
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(ControllerKind::from_str)
                .collect::<Result<BTreeSet<_>>>()?,
            None => ControllerKind::NODE_LOCAL.into_iter().collect(),
        };

        let default_volume_size = match var("FLEET_DEFAULT_VOLUME_SIZE") {
            Some(size) => parse_size(&size)
                .with_context(|| format!("invalid FLEET_DEFAULT_VOLUME_SIZE: {}", size))?,
            None => 10 * GIB,
        };

        let limit_vcpus = match var("FLEET_NODE_VCPUS") {
            Some(n) => n
                .parse()
                .with_context(|| format!("invalid FLEET_NODE_VCPUS: {}", n))?,
            None => std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
        };

        let limit_memory_mib = match var("FLEET_NODE_MEMORY") {
            Some(size) => {
                parse_size(&size).with_context(|| format!("invalid FLEET_NODE_MEMORY: {}", size))?
                    / MIB
            }
            None => 16 * GIB / MIB,
        };

        let heartbeat_period = match var("FLEET_HEARTBEAT_SECS") {
            Some(secs) => Duration::from_secs(
                secs.parse()
                    .with_context(|| format!("invalid FLEET_HEARTBEAT_SECS: {}", secs))?,
            ),
            None => DEFAULT_HEARTBEAT_PERIOD,
        };

        if controllers.is_empty() {
            bail!("FLEET_CONTROLLERS selects no controllers");
        }

        Ok(Self {
            node_name,
            store_path: PathBuf::from(or("FLEET_STORE_PATH", "/var/lib/fleet/state.db")),
            reconcile_interval,
            controllers,
            storage: StorageSettings {
                storage_dir: PathBuf::from(or("FLEET_STORAGE_DIR", "/var/lib/fleet/volumes")),
                image_dir: PathBuf::from(or("FLEET_IMAGE_DIR", "/var/lib/fleet/images")),
                object_pool: or("FLEET_OBJECT_POOL", "fleet"),
                default_volume_size,
            },
            network: NetworkSettings {
                vlan_device: or("FLEET_VLAN_DEVICE", ""),
                vxlan_group: or("FLEET_VXLAN_GROUP", ""),
                vxlan_device: or("FLEET_VXLAN_DEVICE", ""),
            },
            external_bridge: or("FLEET_EXTERNAL_BRIDGE", ""),
            node_limits: NodeSpec {
                limit_vcpus,
                limit_memory_mib,
            },
            heartbeat_period,
            qemu_path: or("FLEET_QEMU_PATH", "qemu-system-x86_64"),
            run_dir: PathBuf::from(or("FLEET_RUN_DIR", "/run/fleet")),
            log_level: or("FLEET_LOG_LEVEL", "info"),
        })
    }

    pub fn runs(&self, kind: ControllerKind) -> bool {
        self.controllers.contains(&kind)
    }
}
