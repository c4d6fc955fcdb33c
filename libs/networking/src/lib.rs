//! Networking utilities for the platform.
//!
//! This library provides helpers for:
//! - Deterministic kernel device naming (bridges, VXLAN devices, veth pairs,
//!   network namespaces)
//! - VLAN sub-interface naming
//! - IPv4/IPv6 CIDR parsing for network specs and router NICs
//!
//! Every node derives the same device name for the same logical network
//! without a naming service: the name is a prefix plus a checksum of the
//! scoping keys, truncated to the kernel interface name limit.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Invalid device name component.
    #[error("invalid device name: {0}")]
    InvalidName(String),
}

// ============================================================================
// Device naming
// ============================================================================

/// Maximum length of a kernel interface name (IFNAMSIZ - 1).
pub const IFNAME_MAX_LEN: usize = 15;

/// Prefix for per-network bridges.
pub const BRIDGE_PREFIX: &str = "br-";

/// Prefix for per-network VXLAN devices.
pub const VXLAN_PREFIX: &str = "vx-";

/// Prefix for router network namespaces.
pub const NETNS_PREFIX: &str = "rt-";

/// Prefix for the host-side end of a router veth pair.
pub const VETH_OUTSIDE_PREFIX: &str = "vo-";

/// Prefix for the namespace-side end of a router veth pair.
pub const VETH_INSIDE_PREFIX: &str = "vi-";

/// Derive a deterministic device name from a prefix and scoping keys.
///
/// The checksum covers every part joined by `/`, so `("a", "bc")` and
/// `("ab", "c")` never collide by concatenation. The result never exceeds
/// [`IFNAME_MAX_LEN`] bytes.
pub fn device_name(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parts.join("/").as_bytes());
    let checksum = hex::encode(hasher.finalize());

    let mut name = String::with_capacity(IFNAME_MAX_LEN);
    name.push_str(prefix);
    name.push_str(&checksum);
    truncate_to_boundary(&mut name, IFNAME_MAX_LEN);
    name
}

/// Bridge name for a logical network.
pub fn bridge_name(group: &str, namespace: &str, network_id: &str) -> String {
    device_name(BRIDGE_PREFIX, &[group, namespace, network_id])
}

/// VXLAN device name for a logical network.
pub fn vxlan_name(group: &str, namespace: &str, network_id: &str) -> String {
    device_name(VXLAN_PREFIX, &[group, namespace, network_id])
}

/// Network namespace name for a virtual router.
pub fn netns_name(group: &str, namespace: &str, router_id: &str) -> String {
    device_name(NETNS_PREFIX, &[group, namespace, router_id])
}

/// A veth pair connecting a router namespace to a host bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethPair {
    /// Host-side end, enslaved to a bridge.
    pub outside: String,
    /// Namespace-side end, carrying the router address.
    pub inside: String,
}

impl VethPair {
    /// Derive the veth pair for a router port.
    ///
    /// `port` distinguishes the external uplink (`"ext"`) from NIC ports
    /// (`"nic0"`, `"nic1"`, ...).
    pub fn for_router(group: &str, namespace: &str, router_id: &str, port: &str) -> Self {
        let parts = [group, namespace, router_id, port];
        Self {
            outside: device_name(VETH_OUTSIDE_PREFIX, &parts),
            inside: device_name(VETH_INSIDE_PREFIX, &parts),
        }
    }
}

/// Derive the VLAN sub-interface name `<physical>.<vlan id>`.
///
/// The physical part is truncated so the whole name fits the kernel limit.
pub fn vlan_interface(physical: &str, vlan_id: u32) -> Result<String, NetworkError> {
    if physical.is_empty() {
        return Err(NetworkError::InvalidName(
            "physical device name is empty".to_string(),
        ));
    }
    if vlan_id == 0 || vlan_id > 4094 {
        return Err(NetworkError::InvalidName(format!(
            "VLAN ID {} out of range 1-4094",
            vlan_id
        )));
    }

    let suffix = format!(".{}", vlan_id);
    let mut base = physical.to_string();
    truncate_to_boundary(&mut base, IFNAME_MAX_LEN - suffix.len());
    base.push_str(&suffix);
    Ok(base)
}

fn truncate_to_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

// ============================================================================
// CIDR helpers
// ============================================================================

/// An IPv4 interface address with prefix (e.g. `10.0.1.1/24`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    /// Host address as written.
    pub address: Ipv4Addr,

    /// Prefix length (0-32).
    pub prefix_len: u8,
}

impl Ipv4Cidr {
    /// Create a new CIDR.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 32 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 32",
                prefix_len
            )));
        }
        Ok(Self {
            address,
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "10.0.1.1/24").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = Ipv4Addr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// The network address (host bits cleared).
    pub fn network(&self) -> Ipv4Addr {
        mask_ipv4(self.address, self.prefix_len)
    }

    /// The network in CIDR notation (e.g. `10.0.1.0/24`), the form used in
    /// masquerade rules.
    pub fn network_cidr(&self) -> String {
        format!("{}/{}", self.network(), self.prefix_len)
    }

    /// Check if an address is within this network.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        mask_ipv4(addr, self.prefix_len) == self.network()
    }
}

impl std::fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

fn mask_ipv4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let bits = u32::from(addr);
    let mask = if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len.min(32)))
    };
    Ipv4Addr::from(bits & mask)
}

/// IPv6 prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Prefix {
    /// Base address of the prefix.
    pub address: Ipv6Addr,

    /// Prefix length (e.g., 64 for /64).
    pub prefix_len: u8,
}

impl Ipv6Prefix {
    /// Create a new prefix.
    pub fn new(address: Ipv6Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 128 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 128",
                prefix_len
            )));
        }

        // Mask the address to the prefix
        let masked = mask_ipv6(address, prefix_len);

        Ok(Self {
            address: masked,
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "2001:db8::/32").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = Ipv6Addr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Check if an address is within this prefix.
    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        let masked = mask_ipv6(addr, self.prefix_len);
        masked == self.address
    }
}

impl std::fmt::Display for Ipv6Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// Mask an IPv6 address to a prefix length.
fn mask_ipv6(addr: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    let bits = u128::from_be_bytes(addr.octets());
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 128 {
        u128::MAX
    } else {
        u128::MAX << (128 - prefix_len)
    };
    Ipv6Addr::from((bits & mask).to_be_bytes())
}

/// Either family of CIDR, as carried by a network spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cidr {
    V4(Ipv4Cidr),
    V6(Ipv6Prefix),
}

impl Cidr {
    /// Parse a CIDR of either family.
    pub fn parse(s: &str) -> Result<Self, NetworkError> {
        if s.contains(':') {
            Ipv6Prefix::from_cidr(s).map(Self::V6)
        } else {
            Ipv4Cidr::from_cidr(s).map(Self::V4)
        }
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V4(c) => c.fmt(f),
            Self::V6(p) => p.fmt(f),
        }
    }
}
