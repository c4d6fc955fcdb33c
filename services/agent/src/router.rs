//! Virtual routers built from kernel network namespaces.
//!
//! ```text
//!   external bridge ── vo-…(ext) ═ vi-…(ext) ─┐
//!                                             │  netns rt-…
//!   network bridge  ── vo-…(nic0) ═ vi-…(nic0)┤  forwarding, default route,
//!   network bridge  ── vo-…(nic1) ═ vi-…(nic1)┘  NAT/DNAT rules
//! ```
//!
//! Every step checks before it acts, so a pass interrupted halfway
//! converges on the next one. A failing step aborts the pass for that router
//! without rolling anything back.
//!
//! The addresses and rules a converged pass applied are kept in the status.
//! When `Spec` drops a NIC or rule, the next pass removes what is no
//! longer wanted.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use fleet_networking::{bridge_name, netns_name, Ipv4Cidr, VethPair};
use fleet_resources::{RouterState, VirtualRouter, ANNOTATION_EXTERNAL_BRIDGE};
use tracing::info;

use crate::engine::{Controller, ControllerError, Outcome, PassContext};
use crate::host::{FirewallRule, NetworkHost};

const EXTERNAL_PORT: &str = "ext";

fn nic_port(index: usize) -> String {
    format!("nic{}", index)
}

pub struct VirtualRouterController {
    host: Arc<dyn NetworkHost>,
    external_bridge: String,
}

impl VirtualRouterController {
    pub fn new(host: Arc<dyn NetworkHost>, external_bridge: impl Into<String>) -> Self {
        Self {
            host,
            external_bridge: external_bridge.into(),
        }
    }

    /// Create the pair if needed, move the inside end into `netns`, attach
    /// the outside end to `bridge`, and address the inside end.
    async fn ensure_port(
        &self,
        netns: &str,
        pair: &VethPair,
        bridge: &str,
        address: &str,
    ) -> Result<(), ControllerError> {
        let host = &self.host;

        if !host.link_exists(None, &pair.outside).await? {
            host.create_veth(&pair.outside, &pair.inside).await?;
        }
        if host.link_exists(None, &pair.inside).await? {
            host.move_to_netns(&pair.inside, netns).await?;
            host.set_up(Some(netns), &pair.inside).await?;
        }
        if host.link_master(&pair.outside).await?.as_deref() != Some(bridge) {
            host.set_master(&pair.outside, bridge).await?;
            host.set_up(None, &pair.outside).await?;
        }
        if !host.has_address(Some(netns), &pair.inside, address).await? {
            host.add_address(Some(netns), &pair.inside, address).await?;
        }
        Ok(())
    }

    async fn ensure_rule(&self, netns: &str, rule: &FirewallRule) -> Result<(), ControllerError> {
        if !self.host.rule_exists(Some(netns), rule).await? {
            self.host.append_rule(Some(netns), rule).await?;
        }
        Ok(())
    }

    /// Remove the address a port carried under an earlier spec.
    async fn drop_stale_address(
        &self,
        netns: &str,
        pair: &VethPair,
        previous: Option<&String>,
        address: &str,
    ) -> Result<(), ControllerError> {
        let Some(previous) = previous.filter(|p| p.as_str() != address) else {
            return Ok(());
        };
        if self.host.link_exists(Some(netns), &pair.inside).await?
            && self.host.has_address(Some(netns), &pair.inside, previous).await?
        {
            info!(netns = %netns, link = %pair.inside, address = %previous, "Removing stale address");
            self.host
                .delete_address(Some(netns), &pair.inside, previous)
                .await?;
        }
        Ok(())
    }

    /// Remove ports and rules recorded by an earlier pass that the router
    /// no longer asks for.
    async fn prune(
        &self,
        router: &VirtualRouter,
        netns: &str,
        addresses: &BTreeMap<String, String>,
        rules: &[String],
    ) -> Result<(), ControllerError> {
        let (group, namespace, id) = (
            router.meta.group.as_str(),
            router.meta.namespace.as_str(),
            router.meta.id.as_str(),
        );

        for port in router.status.addresses.keys() {
            if addresses.contains_key(port) {
                continue;
            }
            let pair = VethPair::for_router(group, namespace, id, port);
            // Deleting one end of a veth pair removes both.
            if self.host.link_exists(None, &pair.outside).await? {
                info!(router = %id, port = %port, "Removing stale port");
                self.host.delete_link(&pair.outside).await?;
            }
        }

        for line in &router.status.rules {
            if rules.contains(line) {
                continue;
            }
            let Some(rule) = FirewallRule::from_line(line) else {
                continue;
            };
            if self.host.rule_exists(Some(netns), &rule).await? {
                info!(router = %id, rule = %line, "Removing stale rule");
                self.host.delete_rule(Some(netns), &rule).await?;
            }
        }
        Ok(())
    }

    async fn teardown(&self, router: &VirtualRouter, netns: &str) -> Result<(), ControllerError> {
        let (group, namespace, id) = (
            router.meta.group.as_str(),
            router.meta.namespace.as_str(),
            router.meta.id.as_str(),
        );

        // Inside ends and in-namespace rules go with the namespace.
        if self.host.netns_exists(netns).await? {
            self.host.delete_netns(netns).await?;
        }

        let ports: BTreeSet<String> = std::iter::once(EXTERNAL_PORT.to_string())
            .chain((0..router.spec.nics.len()).map(nic_port))
            .chain(router.status.addresses.keys().cloned())
            .collect();
        for port in ports {
            let pair = VethPair::for_router(group, namespace, id, &port);
            if self.host.link_exists(None, &pair.outside).await? {
                self.host.delete_link(&pair.outside).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Controller for VirtualRouterController {
    type Kind = VirtualRouter;
    const NAME: &'static str = "virtualrouter";

    async fn reconcile(
        &self,
        _ctx: &PassContext,
        router: &mut VirtualRouter,
    ) -> Result<Outcome, ControllerError> {
        let (group, namespace, id) = (
            router.meta.group.clone(),
            router.meta.namespace.clone(),
            router.meta.id.clone(),
        );
        let netns = netns_name(&group, &namespace, &id);

        if router.meta.is_deleting() {
            self.teardown(router, &netns).await?;
            info!(router = %id, netns = %netns, "Router torn down");
            return Ok(Outcome::Removed);
        }

        let external_bridge = router
            .meta
            .annotation(ANNOTATION_EXTERNAL_BRIDGE)
            .unwrap_or(self.external_bridge.as_str())
            .to_string();
        if external_bridge.is_empty() {
            return Err(ControllerError::Invalid(
                "no external bridge configured".to_string(),
            ));
        }

        router.status.netns = netns.clone();

        if !self.host.netns_exists(&netns).await? {
            info!(router = %id, netns = %netns, "Creating router namespace");
            self.host.create_netns(&netns).await?;
            self.host.set_up(Some(&netns), "lo").await?;
        }

        let mut addresses = BTreeMap::new();
        let mut rules = Vec::new();

        let ext = VethPair::for_router(&group, &namespace, &id, EXTERNAL_PORT);
        let external_ip = router.spec.external_ip.as_str();
        self.drop_stale_address(
            &netns,
            &ext,
            router.status.addresses.get(EXTERNAL_PORT),
            external_ip,
        )
        .await?;
        self.ensure_port(&netns, &ext, &external_bridge, external_ip)
            .await?;
        addresses.insert(EXTERNAL_PORT.to_string(), external_ip.to_string());

        for (index, nic) in router.spec.nics.iter().enumerate() {
            let port = nic_port(index);
            let pair = VethPair::for_router(&group, &namespace, &id, &port);
            let bridge = bridge_name(&group, &namespace, &nic.network);
            let cidr = Ipv4Cidr::from_cidr(&nic.address)
                .map_err(|e| ControllerError::Invalid(format!("nic {}: {}", index, e)))?;

            self.drop_stale_address(&netns, &pair, router.status.addresses.get(&port), &nic.address)
                .await?;
            self.ensure_port(&netns, &pair, &bridge, &nic.address).await?;
            addresses.insert(port, nic.address.clone());

            let rule = FirewallRule::masquerade_out(&cidr.network_cidr(), &ext.inside);
            self.ensure_rule(&netns, &rule).await?;
            rules.push(rule.to_line());
        }

        if !self.host.forwarding_enabled(&netns).await? {
            self.host.enable_forwarding(&netns).await?;
        }

        let gateway = router.spec.external_gateway.as_str();
        if !gateway.is_empty()
            && self.host.default_route(&netns).await?.as_deref() != Some(gateway)
        {
            self.host.set_default_route(&netns, gateway).await?;
        }

        for rule in &router.spec.nat_rules {
            let rule = FirewallRule::snat(&rule.source, &ext.inside, &rule.translated);
            self.ensure_rule(&netns, &rule).await?;
            rules.push(rule.to_line());
        }

        for rule in &router.spec.dnat_rules {
            let rule = FirewallRule::dnat(
                &ext.inside,
                &rule.protocol,
                rule.external_port,
                &rule.internal_address,
                rule.internal_port,
            );
            self.ensure_rule(&netns, &rule).await?;
            rules.push(rule.to_line());
        }

        self.prune(router, &netns, &addresses, &rules).await?;
        router.status.addresses = addresses;
        router.status.rules = rules;

        if router.status.state != RouterState::Running {
            info!(router = %id, netns = %netns, nics = router.spec.nics.len(), "Router running");
        }
        router.status.state = RouterState::Running;
        Ok(Outcome::Keep)
    }
}
