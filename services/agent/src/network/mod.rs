//! Logical networks and their per-node materialization.
//!
//! - [`NetworkController`] (singleton) fans each Network out into one
//!   NodeNetwork per registered Node and aggregates their state back.
//! - [`NodeNetworkController`] (per node) builds the Bridge/VLAN/VXLAN
//!   devices for a NodeNetwork and recomputes its attached interfaces.
//!
//! Device names are derived from `(group, namespace, network id)`, so every
//! node computes the same bridge name for the same logical network.

mod attached;
mod materializer;
mod provisioner;

pub use attached::attached_interfaces;
pub use materializer::{node_network_id, NetworkController};
pub use provisioner::{Backend, NetworkSettings, NodeNetworkController};
