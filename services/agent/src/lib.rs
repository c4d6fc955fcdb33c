//! # fleet-agent
//!
//! The per-node agent. Each controller is a small [`engine::Controller`]
//! implementation driven by its own [`engine::Engine`] loop:
//!
//! - **Cascade**: [`cascade::GroupController`] and
//!   [`cascade::NamespaceController`] fan deletion out to children.
//! - **Networks**: [`network::NetworkController`] materializes one
//!   NodeNetwork per node; [`network::NodeNetworkController`] builds the
//!   bridge and its VLAN/VXLAN uplink.
//! - **Routers**: [`router::VirtualRouterController`] builds a network
//!   namespace per VirtualRouter.
//! - **Storage**: [`storage::BlockStorageController`] and
//!   [`image::ImageEntityController`] manage volumes and images on local
//!   disk or in the object store.
//! - **VMs**: [`vm::VmController`] drives the hypervisor.
//! - **Node**: [`heartbeat::NodeHeartbeat`] registers this node and keeps it
//!   Ready.
//!
//! Everything that touches the OS goes through the traits in [`host`], so
//! the controllers run unchanged against the in-memory fakes in
//! [`host::fake`].

pub mod cascade;
pub mod config;
pub mod engine;
pub mod heartbeat;
pub mod host;
pub mod image;
pub mod network;
pub mod router;
pub mod storage;
pub mod vm;

pub use config::{Config, ControllerKind};
pub use engine::{Controller, ControllerError, Engine, Outcome, PassContext};
