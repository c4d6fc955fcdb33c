//! Bridge/VLAN/VXLAN state machine for one NodeNetwork.
//!
//! Every pass re-checks each device and only creates what is missing, so a
//! converged NodeNetwork costs a handful of reads and no mutations.
//!
//! VLAN sub-interfaces are named `<physical>.<vlan id>` and are therefore
//! shared across networks on the same node. Before creating one we look at
//! which bridge owns it; if another network's bridge does, the transition
//! stops, a diagnostic is appended to the resource's logs, and the engine
//! persists it. That check-then-act is protected only by the store's
//! per-key lock, not by a node-wide one.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_networking::{bridge_name, vlan_interface, vxlan_name, Ipv4Cidr};
use fleet_resources::{
    push_log, LogEntry, NetworkState, NodeNetwork, ANNOTATION_BRIDGE,
    ANNOTATION_DEFAULT_GATEWAY, ANNOTATION_NETWORK_BACKEND, ANNOTATION_VLAN_DEVICE,
    ANNOTATION_VLAN_INTERFACE, ANNOTATION_VXLAN_INTERFACE,
};
use tracing::{info, warn};

use super::attached::attached_interfaces;
use crate::engine::{Controller, ControllerError, Outcome, PassContext};
use crate::host::{FirewallRule, NetworkHost};

/// Node-wide network defaults from configuration.
#[derive(Debug, Clone, Default)]
pub struct NetworkSettings {
    /// Physical device for VLAN sub-interfaces.
    pub vlan_device: String,
    /// Multicast group for VXLAN devices.
    pub vxlan_group: String,
    /// Underlay device for VXLAN devices.
    pub vxlan_device: String,
}

/// Which kind of uplink a network gets on each node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// A bare bridge.
    Bridge,
    /// A bridge plus an 802.1Q sub-interface of a physical device.
    Vlan,
    /// A bridge plus a multicast VXLAN device.
    Vxlan,
}

impl Backend {
    /// Backend selected by annotation. Unknown values fall back to a bare
    /// bridge.
    pub fn from_annotation(value: Option<&str>) -> Self {
        match value.map(str::to_ascii_lowercase).as_deref() {
            None | Some("bridge") => Self::Bridge,
            Some("vlan") => Self::Vlan,
            Some("vxlan") => Self::Vxlan,
            Some(other) => {
                warn!(backend = %other, "Unknown network backend, using bridge");
                Self::Bridge
            }
        }
    }
}

/// A VLAN sub-interface this network may use.
struct VlanClaim {
    parent: String,
    vif: String,
    exists: bool,
}

/// Per-node controller that builds and tears down network devices.
pub struct NodeNetworkController {
    host: Arc<dyn NetworkHost>,
    settings: NetworkSettings,
}

impl NodeNetworkController {
    pub fn new(host: Arc<dyn NetworkHost>, settings: NetworkSettings) -> Self {
        Self { host, settings }
    }

    fn vlan_parent<'a>(&'a self, nn: &'a NodeNetwork) -> Result<&'a str, ControllerError> {
        let device = nn
            .meta
            .annotation(ANNOTATION_VLAN_DEVICE)
            .unwrap_or(self.settings.vlan_device.as_str());
        if device.is_empty() {
            return Err(ControllerError::Invalid(
                "VLAN backend needs a physical device".to_string(),
            ));
        }
        Ok(device)
    }

    /// Masquerade rule for the gateway annotation, if it parses.
    fn gateway_rule(nn: &NodeNetwork, bridge: &str) -> Option<(String, FirewallRule)> {
        let gateway = nn.meta.annotation(ANNOTATION_DEFAULT_GATEWAY)?;
        match Ipv4Cidr::from_cidr(gateway) {
            Ok(cidr) => Some((
                cidr.to_string(),
                FirewallRule::masquerade_from_bridge(&cidr.network_cidr(), bridge),
            )),
            Err(e) => {
                warn!(node_network = %nn.meta.id, gateway = %gateway, error = %e, "Ignoring malformed gateway");
                None
            }
        }
    }

    async fn ensure_bridge(&self, nn: &NodeNetwork, bridge: &str) -> Result<(), ControllerError> {
        if !self.host.link_exists(None, bridge).await? {
            self.host.create_bridge(bridge).await?;
        }

        if let Some((address, rule)) = Self::gateway_rule(nn, bridge) {
            if !self.host.has_address(None, bridge, &address).await? {
                self.host.add_address(None, bridge, &address).await?;
            }
            if !self.host.rule_exists(None, &rule).await? {
                self.host.append_rule(None, &rule).await?;
            }
        }
        Ok(())
    }

    /// Resolve the VLAN sub-interface and make sure no other bridge owns
    /// it. Runs before anything is created on the node.
    async fn claim_vlan(
        &self,
        ctx: &PassContext,
        nn: &mut NodeNetwork,
        bridge: &str,
    ) -> Result<VlanClaim, ControllerError> {
        let parent = self.vlan_parent(nn)?.to_string();
        let vif = vlan_interface(&parent, nn.spec.id)
            .map_err(|e| ControllerError::Invalid(e.to_string()))?;

        let exists = self.host.link_exists(None, &vif).await?;
        if exists {
            if let Some(master) = self.host.link_master(&vif).await? {
                if master != bridge {
                    let message = format!(
                        "VLAN {} on {} is already attached to bridge {}",
                        nn.spec.id, parent, master
                    );
                    push_log(&mut nn.status.logs, LogEntry::new(&ctx.node, &message));
                    return Err(ControllerError::Conflict(message));
                }
            }
        }
        Ok(VlanClaim {
            parent,
            vif,
            exists,
        })
    }

    async fn ensure_vlan(
        &self,
        nn: &mut NodeNetwork,
        claim: VlanClaim,
        bridge: &str,
    ) -> Result<(), ControllerError> {
        let VlanClaim {
            parent,
            vif,
            exists,
        } = claim;

        if !exists {
            self.host.create_vlan(&vif, &parent, nn.spec.id).await?;
        }
        // Also adopts a sub-interface left unattached by an interrupted pass.
        if self.host.link_master(&vif).await?.as_deref() != Some(bridge) {
            self.host.set_master(&vif, bridge).await?;
            self.host.set_up(None, &vif).await?;
        }

        nn.meta
            .annotations
            .insert(ANNOTATION_VLAN_INTERFACE.to_string(), vif);
        Ok(())
    }

    async fn ensure_vxlan(&self, nn: &mut NodeNetwork, bridge: &str) -> Result<(), ControllerError> {
        if self.settings.vxlan_group.is_empty() || self.settings.vxlan_device.is_empty() {
            return Err(ControllerError::Invalid(
                "VXLAN backend needs a multicast group and underlay device".to_string(),
            ));
        }

        let vx = vxlan_name(&nn.meta.group, &nn.meta.namespace, &nn.spec.network);
        if !self.host.link_exists(None, &vx).await? {
            self.host
                .create_vxlan(
                    &vx,
                    nn.spec.id,
                    &self.settings.vxlan_group,
                    &self.settings.vxlan_device,
                )
                .await?;
            self.host.set_master(&vx, bridge).await?;
            self.host.set_up(None, &vx).await?;
        } else if self.host.link_master(&vx).await?.as_deref() != Some(bridge) {
            self.host.set_master(&vx, bridge).await?;
        }

        nn.meta
            .annotations
            .insert(ANNOTATION_VXLAN_INTERFACE.to_string(), vx);
        Ok(())
    }

    /// Tear down in reverse dependency order: sub-device, masquerade rule,
    /// bridge.
    async fn teardown(&self, nn: &NodeNetwork, bridge: &str) -> Result<(), ControllerError> {
        match Backend::from_annotation(nn.meta.annotation(ANNOTATION_NETWORK_BACKEND)) {
            Backend::Bridge => {}
            Backend::Vlan => {
                if let Ok(parent) = self.vlan_parent(nn) {
                    if let Ok(vif) = vlan_interface(parent, nn.spec.id) {
                        // Never delete a sub-interface another network owns.
                        if self.host.link_exists(None, &vif).await?
                            && self.host.link_master(&vif).await?.as_deref() == Some(bridge)
                        {
                            self.host.delete_link(&vif).await?;
                        }
                    }
                }
            }
            Backend::Vxlan => {
                let vx = vxlan_name(&nn.meta.group, &nn.meta.namespace, &nn.spec.network);
                if self.host.link_exists(None, &vx).await? {
                    self.host.delete_link(&vx).await?;
                }
            }
        }

        if let Some((_, rule)) = Self::gateway_rule(nn, bridge) {
            if self.host.rule_exists(None, &rule).await? {
                self.host.delete_rule(None, &rule).await?;
            }
        }

        if self.host.link_exists(None, bridge).await? {
            self.host.delete_link(bridge).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Controller for NodeNetworkController {
    type Kind = NodeNetwork;
    const NAME: &'static str = "nodenetwork";

    async fn reconcile(
        &self,
        ctx: &PassContext,
        nn: &mut NodeNetwork,
    ) -> Result<Outcome, ControllerError> {
        let bridge = bridge_name(&nn.meta.group, &nn.meta.namespace, &nn.spec.network);

        if nn.meta.is_deleting() {
            nn.status.state = NetworkState::Deleting;
            self.teardown(nn, &bridge).await?;
            info!(node_network = %nn.meta.id, bridge = %bridge, "Network torn down");
            return Ok(Outcome::Removed);
        }

        nn.status.attached_interfaces = attached_interfaces(&ctx.resources, nn).await?;

        let backend = Backend::from_annotation(nn.meta.annotation(ANNOTATION_NETWORK_BACKEND));
        let claim = match backend {
            Backend::Vlan => Some(self.claim_vlan(ctx, nn, &bridge).await?),
            _ => None,
        };

        self.ensure_bridge(nn, &bridge).await?;
        match (backend, claim) {
            (Backend::Vlan, Some(claim)) => self.ensure_vlan(nn, claim, &bridge).await?,
            (Backend::Vxlan, _) => self.ensure_vxlan(nn, &bridge).await?,
            _ => {}
        }

        nn.meta
            .annotations
            .insert(ANNOTATION_BRIDGE.to_string(), bridge.clone());

        if nn.status.state != NetworkState::Available {
            info!(node_network = %nn.meta.id, bridge = %bridge, "Network available");
        }
        nn.status.state = NetworkState::Available;
        Ok(Outcome::Keep)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(None, Backend::Bridge)]
    #[case(Some("bridge"), Backend::Bridge)]
    #[case(Some("VLAN"), Backend::Vlan)]
    #[case(Some("vxlan"), Backend::Vxlan)]
    #[case(Some("ovs"), Backend::Bridge)]
    fn test_backend_from_annotation(#[case] value: Option<&str>, #[case] expected: Backend) {
        assert_eq!(Backend::from_annotation(value), expected);
    }
}
