//! [`NetworkHost`] backed by `ip`, `iptables`, and sysfs.

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info};

use super::exec::{run_in, run_ip, succeeds, succeeds_in};
use super::{FirewallRule, HostError, NetworkHost};

/// VXLAN UDP port (IANA).
const VXLAN_PORT: &str = "4789";

/// Drives the kernel through the `ip` and `iptables` tools.
#[derive(Debug, Clone, Default)]
pub struct ExecNetworkHost;

impl ExecNetworkHost {
    pub fn new() -> Self {
        Self
    }
}

fn rule_args<'a>(op: &'a str, rule: &'a FirewallRule) -> Vec<&'a str> {
    let mut args = vec!["-w", "-t", rule.table.as_str(), op, rule.chain.as_str()];
    args.extend(rule.args.iter().map(String::as_str));
    args
}

#[async_trait]
impl NetworkHost for ExecNetworkHost {
    async fn link_exists(&self, netns: Option<&str>, name: &str) -> Result<bool, HostError> {
        match netns {
            None => Ok(Path::new(&format!("/sys/class/net/{}", name)).exists()),
            Some(ns) => succeeds("ip", &["-n", ns, "link", "show", "dev", name]).await,
        }
    }

    async fn link_master(&self, name: &str) -> Result<Option<String>, HostError> {
        let path = format!("/sys/class/net/{}/master", name);
        match tokio::fs::read_link(&path).await {
            Ok(target) => Ok(target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_bridge(&self, name: &str) -> Result<(), HostError> {
        info!(bridge = %name, "Creating bridge");
        run_ip(None, &["link", "add", name, "type", "bridge"]).await?;
        run_ip(None, &["link", "set", "dev", name, "up"]).await?;
        Ok(())
    }

    async fn create_vlan(&self, name: &str, parent: &str, vlan_id: u32) -> Result<(), HostError> {
        info!(link = %name, parent = %parent, vlan_id, "Creating VLAN interface");
        let id = vlan_id.to_string();
        run_ip(
            None,
            &["link", "add", "link", parent, "name", name, "type", "vlan", "id", &id],
        )
        .await?;
        Ok(())
    }

    async fn create_vxlan(
        &self,
        name: &str,
        vni: u32,
        group: &str,
        device: &str,
    ) -> Result<(), HostError> {
        info!(link = %name, vni, group = %group, device = %device, "Creating VXLAN interface");
        let id = vni.to_string();
        run_ip(
            None,
            &[
                "link", "add", name, "type", "vxlan", "id", &id, "group", group, "dev", device,
                "dstport", VXLAN_PORT,
            ],
        )
        .await?;
        Ok(())
    }

    async fn create_veth(&self, outside: &str, inside: &str) -> Result<(), HostError> {
        info!(outside = %outside, inside = %inside, "Creating veth pair");
        run_ip(
            None,
            &["link", "add", outside, "type", "veth", "peer", "name", inside],
        )
        .await?;
        Ok(())
    }

    async fn set_master(&self, name: &str, bridge: &str) -> Result<(), HostError> {
        run_ip(None, &["link", "set", "dev", name, "master", bridge]).await?;
        Ok(())
    }

    async fn set_up(&self, netns: Option<&str>, name: &str) -> Result<(), HostError> {
        run_ip(netns, &["link", "set", "dev", name, "up"]).await?;
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> Result<(), HostError> {
        info!(link = %name, "Deleting link");
        run_ip(None, &["link", "delete", name]).await?;
        Ok(())
    }

    async fn has_address(
        &self,
        netns: Option<&str>,
        name: &str,
        cidr: &str,
    ) -> Result<bool, HostError> {
        let out = run_ip(netns, &["-o", "addr", "show", "dev", name]).await?;
        Ok(out
            .split_whitespace()
            .any(|field| field == cidr))
    }

    async fn add_address(
        &self,
        netns: Option<&str>,
        name: &str,
        cidr: &str,
    ) -> Result<(), HostError> {
        debug!(link = %name, address = %cidr, "Adding address");
        run_ip(netns, &["addr", "add", cidr, "dev", name]).await?;
        Ok(())
    }

    async fn delete_address(
        &self,
        netns: Option<&str>,
        name: &str,
        cidr: &str,
    ) -> Result<(), HostError> {
        debug!(link = %name, address = %cidr, "Removing address");
        run_ip(netns, &["addr", "del", cidr, "dev", name]).await?;
        Ok(())
    }

    async fn netns_exists(&self, name: &str) -> Result<bool, HostError> {
        Ok(Path::new(&format!("/run/netns/{}", name)).exists())
    }

    async fn create_netns(&self, name: &str) -> Result<(), HostError> {
        info!(netns = %name, "Creating network namespace");
        run_ip(None, &["netns", "add", name]).await?;
        Ok(())
    }

    async fn delete_netns(&self, name: &str) -> Result<(), HostError> {
        info!(netns = %name, "Deleting network namespace");
        run_ip(None, &["netns", "delete", name]).await?;
        Ok(())
    }

    async fn move_to_netns(&self, name: &str, netns: &str) -> Result<(), HostError> {
        run_ip(None, &["link", "set", "dev", name, "netns", netns]).await?;
        Ok(())
    }

    async fn default_route(&self, netns: &str) -> Result<Option<String>, HostError> {
        let out = run_ip(Some(netns), &["route", "show", "default"]).await?;
        let mut fields = out.split_whitespace();
        while let Some(field) = fields.next() {
            if field == "via" {
                return Ok(fields.next().map(str::to_string));
            }
        }
        Ok(None)
    }

    async fn set_default_route(&self, netns: &str, gateway: &str) -> Result<(), HostError> {
        run_ip(Some(netns), &["route", "replace", "default", "via", gateway]).await?;
        Ok(())
    }

    async fn forwarding_enabled(&self, netns: &str) -> Result<bool, HostError> {
        let out = run_in(Some(netns), "sysctl", &["-n", "net.ipv4.ip_forward"]).await?;
        Ok(out.trim() == "1")
    }

    async fn enable_forwarding(&self, netns: &str) -> Result<(), HostError> {
        run_in(Some(netns), "sysctl", &["-w", "net.ipv4.ip_forward=1"]).await?;
        Ok(())
    }

    async fn rule_exists(
        &self,
        netns: Option<&str>,
        rule: &FirewallRule,
    ) -> Result<bool, HostError> {
        succeeds_in(netns, "iptables", &rule_args("-C", rule)).await
    }

    async fn append_rule(
        &self,
        netns: Option<&str>,
        rule: &FirewallRule,
    ) -> Result<(), HostError> {
        debug!(netns = ?netns, chain = %rule.chain, args = %rule.args.join(" "), "Appending rule");
        run_in(netns, "iptables", &rule_args("-A", rule)).await?;
        Ok(())
    }

    async fn delete_rule(
        &self,
        netns: Option<&str>,
        rule: &FirewallRule,
    ) -> Result<(), HostError> {
        run_in(netns, "iptables", &rule_args("-D", rule)).await?;
        Ok(())
    }
}
