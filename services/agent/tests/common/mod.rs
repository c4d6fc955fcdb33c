//! Shared setup for agent integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fleet_agent::engine::{Controller, Engine, PassContext};
use fleet_agent::storage::StorageSettings;
use fleet_resources::{
    Group, GroupSpec, Kind, Meta, Namespace, NamespaceSpec, Node, NodeSpec, GIB,
};
use fleet_store::{MemoryStore, Resources};

pub const GROUP: &str = "g1";
pub const NAMESPACE: &str = "ns1";

pub fn resources() -> Resources {
    Resources::new(Arc::new(MemoryStore::new()))
}

/// Resources with `g1/ns1` already created.
pub async fn scoped_resources() -> Resources {
    let resources = resources();
    create_scope(&resources, GROUP, NAMESPACE).await;
    resources
}

pub async fn create_scope(resources: &Resources, group: &str, namespace: &str) {
    if resources.find::<Group>("", "", group).await.unwrap().is_none() {
        let mut g = Group::new(Meta::cluster(group), GroupSpec::default());
        resources.create(&mut g).await.unwrap();
    }
    let mut ns = Namespace::new(Meta::grouped(group, namespace), NamespaceSpec::default());
    resources.create(&mut ns).await.unwrap();
}

pub async fn register_node(resources: &Resources, node: &str) {
    let mut n = Node::new(
        Meta::cluster(node).with_node(node),
        NodeSpec {
            limit_vcpus: 16,
            limit_memory_mib: 32 * 1024,
        },
    );
    resources.create(&mut n).await.unwrap();
}

pub fn engine<C: Controller>(controller: C, resources: &Resources, node: &str) -> Engine<C> {
    let ctx = PassContext {
        node: node.to_string(),
        resources: resources.clone(),
    };
    Engine::new(controller, ctx, Duration::from_millis(10))
}

pub async fn create<K: Kind>(resources: &Resources, mut resource: K) -> K {
    resources.create(&mut resource).await.unwrap();
    resource
}

pub async fn get<K: Kind>(resources: &Resources, group: &str, namespace: &str, id: &str) -> K {
    resources.get::<K>(group, namespace, id).await.unwrap()
}

pub fn storage_settings() -> StorageSettings {
    StorageSettings {
        storage_dir: PathBuf::from("/var/lib/fleet/volumes"),
        image_dir: PathBuf::from("/var/lib/fleet/images"),
        object_pool: "fleet".to_string(),
        default_volume_size: GIB,
    }
}
