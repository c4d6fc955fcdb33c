//! In-memory collaborators for tests and dry runs.
//!
//! Each fake models just enough kernel/tool behaviour for the controllers to
//! be exercised end to end: duplicate creates fail, deleting a veth end
//! removes its peer, protected snapshots block removal, and so on. Every
//! mutating call is counted so tests can assert that a converged pass
//! touches nothing.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{
    CopyResult, DiskHost, FirewallRule, HostError, Hypervisor, NetworkHost, ObjectStore,
    VmLaunch,
};

fn failed(command: impl Into<String>, stderr: &str) -> HostError {
    HostError::CommandFailed {
        command: command.into(),
        stderr: stderr.to_string(),
    }
}

// ============================================================================
// Network
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Physical,
    Bridge,
    Vlan { parent: String, id: u32 },
    Vxlan { vni: u32, group: String, device: String },
    Veth { peer: String },
    Loopback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeLink {
    pub kind: LinkKind,
    pub master: Option<String>,
    pub up: bool,
    pub addresses: Vec<String>,
}

impl FakeLink {
    fn new(kind: LinkKind) -> Self {
        Self {
            kind,
            master: None,
            up: false,
            addresses: Vec::new(),
        }
    }
}

type LinkKey = (Option<String>, String);

fn key(netns: Option<&str>, name: &str) -> LinkKey {
    (netns.map(str::to_string), name.to_string())
}

#[derive(Debug, Default)]
struct NetState {
    links: BTreeMap<LinkKey, FakeLink>,
    netns: BTreeSet<String>,
    rules: Vec<(Option<String>, FirewallRule)>,
    routes: BTreeMap<String, String>,
    forwarding: BTreeSet<String>,
    failing: HashSet<&'static str>,
    mutations: u64,
}

impl NetState {
    fn mutate(&mut self, op: &'static str) -> Result<(), HostError> {
        if self.failing.contains(op) {
            return Err(failed(op, "injected failure"));
        }
        self.mutations += 1;
        Ok(())
    }

    fn link_mut(&mut self, netns: Option<&str>, name: &str) -> Result<&mut FakeLink, HostError> {
        self.links
            .get_mut(&key(netns, name))
            .ok_or_else(|| failed(format!("ip link {}", name), "Cannot find device"))
    }

    fn insert_link(&mut self, netns: Option<&str>, name: &str, link: FakeLink) -> Result<(), HostError> {
        let k = key(netns, name);
        if self.links.contains_key(&k) {
            return Err(failed(format!("ip link add {}", name), "File exists"));
        }
        self.links.insert(k, link);
        Ok(())
    }

    /// Remove a link; a veth takes its peer with it wherever the peer lives.
    fn remove_link(&mut self, k: &LinkKey) {
        if let Some(link) = self.links.remove(k) {
            if let LinkKind::Veth { peer } = link.kind {
                self.links.retain(|(_, name), _| name != &peer);
            }
            let name = &k.1;
            for other in self.links.values_mut() {
                if other.master.as_deref() == Some(name.as_str()) {
                    other.master = None;
                }
            }
        }
    }
}

/// Kernel networking modelled in memory.
#[derive(Debug, Default)]
pub struct FakeNetworkHost {
    state: Mutex<NetState>,
}

impl FakeNetworkHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a physical device in the root namespace.
    pub async fn add_physical(&self, name: &str) {
        let mut state = self.state.lock().await;
        let mut link = FakeLink::new(LinkKind::Physical);
        link.up = true;
        state.links.insert(key(None, name), link);
    }

    /// Make every future call of `op` (the trait method name) fail.
    pub async fn fail(&self, op: &'static str) {
        self.state.lock().await.failing.insert(op);
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.failing.clear();
    }

    pub async fn link(&self, netns: Option<&str>, name: &str) -> Option<FakeLink> {
        self.state.lock().await.links.get(&key(netns, name)).cloned()
    }

    /// Names of links in a namespace.
    pub async fn links_in(&self, netns: Option<&str>) -> Vec<String> {
        let owner = netns.map(str::to_string);
        self.state
            .lock()
            .await
            .links
            .keys()
            .filter(|(ns, _)| *ns == owner)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub async fn rules(&self, netns: Option<&str>) -> Vec<FirewallRule> {
        let owner = netns.map(str::to_string);
        self.state
            .lock()
            .await
            .rules
            .iter()
            .filter(|(ns, _)| *ns == owner)
            .map(|(_, rule)| rule.clone())
            .collect()
    }

    pub async fn namespaces(&self) -> Vec<String> {
        self.state.lock().await.netns.iter().cloned().collect()
    }

    pub async fn route(&self, netns: &str) -> Option<String> {
        self.state.lock().await.routes.get(netns).cloned()
    }

    pub async fn forwarding(&self, netns: &str) -> bool {
        self.state.lock().await.forwarding.contains(netns)
    }

    /// Number of mutating calls attempted so far.
    pub async fn mutations(&self) -> u64 {
        self.state.lock().await.mutations
    }
}

#[async_trait]
impl NetworkHost for FakeNetworkHost {
    async fn link_exists(&self, netns: Option<&str>, name: &str) -> Result<bool, HostError> {
        Ok(self.state.lock().await.links.contains_key(&key(netns, name)))
    }

    async fn link_master(&self, name: &str) -> Result<Option<String>, HostError> {
        let state = self.state.lock().await;
        Ok(state
            .links
            .get(&key(None, name))
            .and_then(|l| l.master.clone()))
    }

    async fn create_bridge(&self, name: &str) -> Result<(), HostError> {
        let mut state = self.state.lock().await;
        state.mutate("create_bridge")?;
        let mut link = FakeLink::new(LinkKind::Bridge);
        link.up = true;
        state.insert_link(None, name, link)
    }

    async fn create_vlan(&self, name: &str, parent: &str, vlan_id: u32) -> Result<(), HostError> {
        let mut state = self.state.lock().await;
        state.mutate("create_vlan")?;
        state.link_mut(None, parent)?;
        state.insert_link(
            None,
            name,
            FakeLink::new(LinkKind::Vlan {
                parent: parent.to_string(),
                id: vlan_id,
            }),
        )
    }

    async fn create_vxlan(
        &self,
        name: &str,
        vni: u32,
        group: &str,
        device: &str,
    ) -> Result<(), HostError> {
        let mut state = self.state.lock().await;
        state.mutate("create_vxlan")?;
        state.link_mut(None, device)?;
        state.insert_link(
            None,
            name,
            FakeLink::new(LinkKind::Vxlan {
                vni,
                group: group.to_string(),
                device: device.to_string(),
            }),
        )
    }

    async fn create_veth(&self, outside: &str, inside: &str) -> Result<(), HostError> {
        let mut state = self.state.lock().await;
        state.mutate("create_veth")?;
        state.insert_link(
            None,
            outside,
            FakeLink::new(LinkKind::Veth {
                peer: inside.to_string(),
            }),
        )?;
        state.insert_link(
            None,
            inside,
            FakeLink::new(LinkKind::Veth {
                peer: outside.to_string(),
            }),
        )
    }

    async fn set_master(&self, name: &str, bridge: &str) -> Result<(), HostError> {
        let mut state = self.state.lock().await;
        state.mutate("set_master")?;
        state.link_mut(None, bridge)?;
        state.link_mut(None, name)?.master = Some(bridge.to_string());
        Ok(())
    }

    async fn set_up(&self, netns: Option<&str>, name: &str) -> Result<(), HostError> {
        let mut state = self.state.lock().await;
        state.mutate("set_up")?;
        state.link_mut(netns, name)?.up = true;
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> Result<(), HostError> {
        let mut state = self.state.lock().await;
        state.mutate("delete_link")?;
        state.link_mut(None, name)?;
        state.remove_link(&key(None, name));
        Ok(())
    }

    async fn has_address(
        &self,
        netns: Option<&str>,
        name: &str,
        cidr: &str,
    ) -> Result<bool, HostError> {
        let mut state = self.state.lock().await;
        Ok(state.link_mut(netns, name)?.addresses.iter().any(|a| a == cidr))
    }

    async fn add_address(
        &self,
        netns: Option<&str>,
        name: &str,
        cidr: &str,
    ) -> Result<(), HostError> {
        let mut state = self.state.lock().await;
        state.mutate("add_address")?;
        let link = state.link_mut(netns, name)?;
        if link.addresses.iter().any(|a| a == cidr) {
            return Err(failed("ip addr add", "Address already assigned"));
        }
        link.addresses.push(cidr.to_string());
        Ok(())
    }

    async fn delete_address(
        &self,
        netns: Option<&str>,
        name: &str,
        cidr: &str,
    ) -> Result<(), HostError> {
        let mut state = self.state.lock().await;
        state.mutate("delete_address")?;
        let link = state.link_mut(netns, name)?;
        let pos = link
            .addresses
            .iter()
            .position(|a| a == cidr)
            .ok_or_else(|| failed("ip addr del", "Cannot assign requested address"))?;
        link.addresses.remove(pos);
        Ok(())
    }

    async fn netns_exists(&self, name: &str) -> Result<bool, HostError> {
        Ok(self.state.lock().await.netns.contains(name))
    }

    async fn create_netns(&self, name: &str) -> Result<(), HostError> {
        let mut state = self.state.lock().await;
        state.mutate("create_netns")?;
        if !state.netns.insert(name.to_string()) {
            return Err(failed("ip netns add", "File exists"));
        }
        state
            .links
            .insert(key(Some(name), "lo"), FakeLink::new(LinkKind::Loopback));
        Ok(())
    }

    async fn delete_netns(&self, name: &str) -> Result<(), HostError> {
        let mut state = self.state.lock().await;
        state.mutate("delete_netns")?;
        if !state.netns.remove(name) {
            return Err(failed("ip netns delete", "No such file or directory"));
        }
        let inside: Vec<LinkKey> = state
            .links
            .keys()
            .filter(|(ns, _)| ns.as_deref() == Some(name))
            .cloned()
            .collect();
        for k in inside {
            state.remove_link(&k);
        }
        state.rules.retain(|(ns, _)| ns.as_deref() != Some(name));
        state.routes.remove(name);
        state.forwarding.remove(name);
        Ok(())
    }

    async fn move_to_netns(&self, name: &str, netns: &str) -> Result<(), HostError> {
        let mut state = self.state.lock().await;
        state.mutate("move_to_netns")?;
        if !state.netns.contains(netns) {
            return Err(failed("ip link set netns", "Invalid netns value"));
        }
        let link = state
            .links
            .remove(&key(None, name))
            .ok_or_else(|| failed("ip link set netns", "Cannot find device"))?;
        state.links.insert(key(Some(netns), name), link);
        Ok(())
    }

    async fn default_route(&self, netns: &str) -> Result<Option<String>, HostError> {
        Ok(self.state.lock().await.routes.get(netns).cloned())
    }

    async fn set_default_route(&self, netns: &str, gateway: &str) -> Result<(), HostError> {
        let mut state = self.state.lock().await;
        state.mutate("set_default_route")?;
        state.routes.insert(netns.to_string(), gateway.to_string());
        Ok(())
    }

    async fn forwarding_enabled(&self, netns: &str) -> Result<bool, HostError> {
        Ok(self.state.lock().await.forwarding.contains(netns))
    }

    async fn enable_forwarding(&self, netns: &str) -> Result<(), HostError> {
        let mut state = self.state.lock().await;
        state.mutate("enable_forwarding")?;
        state.forwarding.insert(netns.to_string());
        Ok(())
    }

    async fn rule_exists(
        &self,
        netns: Option<&str>,
        rule: &FirewallRule,
    ) -> Result<bool, HostError> {
        let owner = netns.map(str::to_string);
        Ok(self
            .state
            .lock()
            .await
            .rules
            .iter()
            .any(|(ns, r)| *ns == owner && r == rule))
    }

    async fn append_rule(
        &self,
        netns: Option<&str>,
        rule: &FirewallRule,
    ) -> Result<(), HostError> {
        let mut state = self.state.lock().await;
        state.mutate("append_rule")?;
        state.rules.push((netns.map(str::to_string), rule.clone()));
        Ok(())
    }

    async fn delete_rule(
        &self,
        netns: Option<&str>,
        rule: &FirewallRule,
    ) -> Result<(), HostError> {
        let mut state = self.state.lock().await;
        state.mutate("delete_rule")?;
        let owner = netns.map(str::to_string);
        let pos = state
            .rules
            .iter()
            .position(|(ns, r)| *ns == owner && r == rule)
            .ok_or_else(|| failed("iptables -D", "Bad rule"))?;
        state.rules.remove(pos);
        Ok(())
    }
}

// ============================================================================
// Disk
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeImage {
    pub size_bytes: u64,
    /// Stand-in for the image bytes; copies carry it over.
    pub content: String,
}

#[derive(Debug, Default)]
struct DiskState {
    images: BTreeMap<PathBuf, FakeImage>,
    urls: BTreeMap<String, FakeImage>,
    fail_copies: bool,
    mutations: u64,
}

/// Local disk images modelled in memory.
#[derive(Debug, Default)]
pub struct FakeDiskHost {
    state: Mutex<DiskState>,
}

impl FakeDiskHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `url` downloadable with the given size.
    pub async fn serve(&self, url: &str, size_bytes: u64) {
        self.state.lock().await.urls.insert(
            url.to_string(),
            FakeImage {
                size_bytes,
                content: url.to_string(),
            },
        );
    }

    pub async fn fail_copies(&self, fail: bool) {
        self.state.lock().await.fail_copies = fail;
    }

    pub async fn image(&self, path: &Path) -> Option<FakeImage> {
        self.state.lock().await.images.get(path).cloned()
    }

    pub async fn image_count(&self) -> usize {
        self.state.lock().await.images.len()
    }

    pub async fn mutations(&self) -> u64 {
        self.state.lock().await.mutations
    }
}

#[async_trait]
impl DiskHost for FakeDiskHost {
    async fn image_exists(&self, path: &Path) -> Result<bool, HostError> {
        Ok(self.state.lock().await.images.contains_key(path))
    }

    async fn create_image(&self, path: &Path, size_bytes: u64) -> Result<(), HostError> {
        let mut state = self.state.lock().await;
        state.mutations += 1;
        debug!(path = %path.display(), size_bytes, "[FAKE] Creating disk image");
        state.images.insert(
            path.to_path_buf(),
            FakeImage {
                size_bytes,
                content: format!("zero:{}", size_bytes),
            },
        );
        Ok(())
    }

    async fn image_size(&self, path: &Path) -> Result<u64, HostError> {
        self.state
            .lock()
            .await
            .images
            .get(path)
            .map(|i| i.size_bytes)
            .ok_or_else(|| HostError::NotFound(path.display().to_string()))
    }

    async fn copy_image(&self, src: &Path, dst: &Path) -> Result<CopyResult, HostError> {
        let mut state = self.state.lock().await;
        if state.fail_copies {
            return Err(HostError::Io(std::io::Error::other("injected copy failure")));
        }
        let image = state
            .images
            .get(src)
            .cloned()
            .ok_or_else(|| HostError::NotFound(src.display().to_string()))?;
        state.mutations += 1;

        let sha256 = hex::encode(Sha256::digest(image.content.as_bytes()));
        let size_bytes = image.size_bytes;
        state.images.insert(dst.to_path_buf(), image);
        Ok(CopyResult { size_bytes, sha256 })
    }

    async fn download(&self, url: &str, dst: &Path) -> Result<u64, HostError> {
        let mut state = self.state.lock().await;
        let image = state
            .urls
            .get(url)
            .cloned()
            .ok_or_else(|| HostError::Download(format!("{}: 404 Not Found", url)))?;
        state.mutations += 1;
        let size_bytes = image.size_bytes;
        state.images.insert(dst.to_path_buf(), image);
        Ok(size_bytes)
    }

    async fn remove_image(&self, path: &Path) -> Result<(), HostError> {
        let mut state = self.state.lock().await;
        if state.images.remove(path).is_some() {
            state.mutations += 1;
        }
        Ok(())
    }
}

// ============================================================================
// Object store
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeObject {
    pub size_bytes: u64,
    /// Snapshot this image was cloned from, if any.
    pub parent: Option<String>,
    /// Snapshot name -> protected.
    pub snapshots: BTreeMap<String, bool>,
}

/// An object-store pool modelled in memory.
#[derive(Debug, Default)]
pub struct FakeObjectStore {
    images: Mutex<BTreeMap<String, FakeObject>>,
}

impl FakeObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn object(&self, image: &str) -> Option<FakeObject> {
        self.images.lock().await.get(image).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        self.images.lock().await.keys().cloned().collect()
    }
}

fn missing(image: &str) -> HostError {
    failed(format!("rbd {}", image), "No such file or directory")
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn image_exists(&self, image: &str) -> Result<bool, HostError> {
        Ok(self.images.lock().await.contains_key(image))
    }

    async fn create_image(&self, image: &str, size_bytes: u64) -> Result<(), HostError> {
        let mut images = self.images.lock().await;
        if images.contains_key(image) {
            return Err(failed("rbd create", "image already exists"));
        }
        images.insert(
            image.to_string(),
            FakeObject {
                size_bytes,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn image_size(&self, image: &str) -> Result<u64, HostError> {
        self.images
            .lock()
            .await
            .get(image)
            .map(|o| o.size_bytes)
            .ok_or_else(|| missing(image))
    }

    async fn copy_image(&self, src: &str, dst: &str) -> Result<(), HostError> {
        let mut images = self.images.lock().await;
        let size_bytes = images.get(src).ok_or_else(|| missing(src))?.size_bytes;
        images.insert(
            dst.to_string(),
            FakeObject {
                size_bytes,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn clone_image(&self, snapshot: &str, dst: &str) -> Result<(), HostError> {
        let mut images = self.images.lock().await;
        let (image, snap) = snapshot
            .split_once('@')
            .ok_or_else(|| failed("rbd clone", "snapshot name required"))?;
        let parent = images.get(image).ok_or_else(|| missing(image))?;
        match parent.snapshots.get(snap) {
            Some(true) => {}
            Some(false) => return Err(failed("rbd clone", "parent snapshot must be protected")),
            None => return Err(missing(snapshot)),
        }
        let size_bytes = parent.size_bytes;
        images.insert(
            dst.to_string(),
            FakeObject {
                size_bytes,
                parent: Some(snapshot.to_string()),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn import_image(&self, src: &Path, image: &str) -> Result<(), HostError> {
        let mut images = self.images.lock().await;
        images.insert(
            image.to_string(),
            FakeObject {
                size_bytes: 0,
                parent: Some(src.display().to_string()),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<(), HostError> {
        let mut images = self.images.lock().await;
        let object = images.get(image).ok_or_else(|| missing(image))?;
        if !object.snapshots.is_empty() {
            return Err(failed("rbd rm", "image has snapshots - not removing"));
        }
        images.remove(image);
        Ok(())
    }

    async fn list_snapshots(&self, image: &str) -> Result<Vec<String>, HostError> {
        let images = self.images.lock().await;
        let object = images.get(image).ok_or_else(|| missing(image))?;
        Ok(object.snapshots.keys().cloned().collect())
    }

    async fn create_snapshot(&self, image: &str, snap: &str) -> Result<(), HostError> {
        let mut images = self.images.lock().await;
        let object = images.get_mut(image).ok_or_else(|| missing(image))?;
        if object.snapshots.contains_key(snap) {
            return Err(failed("rbd snap create", "snapshot already exists"));
        }
        object.snapshots.insert(snap.to_string(), false);
        Ok(())
    }

    async fn protect_snapshot(&self, image: &str, snap: &str) -> Result<(), HostError> {
        let mut images = self.images.lock().await;
        let object = images.get_mut(image).ok_or_else(|| missing(image))?;
        let protected = object
            .snapshots
            .get_mut(snap)
            .ok_or_else(|| missing(snap))?;
        *protected = true;
        Ok(())
    }

    async fn unprotect_snapshot(&self, image: &str, snap: &str) -> Result<(), HostError> {
        let mut images = self.images.lock().await;
        let full = format!("{}@{}", image, snap);
        if images.values().any(|o| o.parent.as_deref() == Some(full.as_str())) {
            return Err(failed("rbd snap unprotect", "snapshot has clones"));
        }
        let object = images.get_mut(image).ok_or_else(|| missing(image))?;
        let protected = object
            .snapshots
            .get_mut(snap)
            .ok_or_else(|| missing(snap))?;
        *protected = false;
        Ok(())
    }

    async fn remove_snapshot(&self, image: &str, snap: &str) -> Result<(), HostError> {
        let mut images = self.images.lock().await;
        let object = images.get_mut(image).ok_or_else(|| missing(image))?;
        match object.snapshots.get(snap) {
            Some(true) => Err(failed("rbd snap rm", "snapshot is protected")),
            Some(false) => {
                object.snapshots.remove(snap);
                Ok(())
            }
            None => Err(missing(snap)),
        }
    }
}

// ============================================================================
// Hypervisor
// ============================================================================

/// Hypervisor that records launches instead of starting processes.
#[derive(Debug, Default)]
pub struct MockHypervisor {
    running: Mutex<BTreeMap<Uuid, VmLaunch>>,
    fail_starts: bool,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// A hypervisor whose starts always fail.
    pub fn failing() -> Self {
        Self {
            fail_starts: true,
            ..Default::default()
        }
    }

    pub async fn launch(&self, uuid: Uuid) -> Option<VmLaunch> {
        self.running.lock().await.get(&uuid).cloned()
    }

    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    /// Simulate the process dying on its own.
    pub async fn crash(&self, uuid: Uuid) {
        self.running.lock().await.remove(&uuid);
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn start(&self, launch: &VmLaunch) -> Result<(), HostError> {
        if self.fail_starts {
            return Err(failed("qemu", "Mock hypervisor configured to fail"));
        }
        debug!(uuid = %launch.uuid, name = %launch.name, "[MOCK] Starting VM");
        self.running.lock().await.insert(launch.uuid, launch.clone());
        Ok(())
    }

    async fn stop(&self, uuid: Uuid) -> Result<(), HostError> {
        debug!(uuid = %uuid, "[MOCK] Stopping VM");
        self.running.lock().await.remove(&uuid);
        Ok(())
    }

    async fn is_running(&self, uuid: Uuid) -> Result<bool, HostError> {
        Ok(self.running.lock().await.contains_key(&uuid))
    }
}
