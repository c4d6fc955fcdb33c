//! Typed repository behaviour against both backends.

use std::sync::Arc;

use fleet_resources::{
    BlockStorage, BlockStorageSpec, Group, Kind, Meta, Namespace, Node, NodeSpec,
};
use fleet_store::{MemoryStore, ResourceStore, Resources, SqliteStore, StoreError};
use rstest::rstest;

fn backend(kind: &str) -> Arc<dyn ResourceStore> {
    match kind {
        "memory" => Arc::new(MemoryStore::new()),
        _ => Arc::new(SqliteStore::open_in_memory().unwrap()),
    }
}

fn block_storage(ns: &str, id: &str) -> BlockStorage {
    BlockStorage::new(
        Meta::namespaced("g1", ns, id).with_node("node-a"),
        BlockStorageSpec {
            limit_size: "10G".to_string(),
            ..Default::default()
        },
    )
}

#[rstest]
#[case("memory")]
#[case("sqlite")]
#[tokio::test]
async fn test_create_stamps_hash_and_rejects_duplicates(#[case] kind: &str) {
    let resources = Resources::new(backend(kind));

    let mut bs = block_storage("ns1", "bs1");
    resources.create(&mut bs).await.unwrap();
    assert_eq!(bs.meta.resource_hash, bs.content_hash().unwrap().as_str());

    let stored: BlockStorage = resources.get("g1", "ns1", "bs1").await.unwrap();
    assert_eq!(stored, bs);

    let mut again = block_storage("ns1", "bs1");
    let err = resources.create(&mut again).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists(_)));
}

#[rstest]
#[case("memory")]
#[case("sqlite")]
#[tokio::test]
async fn test_list_is_scoped(#[case] kind: &str) {
    let resources = Resources::new(backend(kind));
    for (ns, id) in [("ns1", "a"), ("ns1", "b"), ("ns10", "c")] {
        resources.create(&mut block_storage(ns, id)).await.unwrap();
    }

    let listed: Vec<BlockStorage> = resources.list("g1", "ns1").await.unwrap();
    let ids: Vec<_> = listed.iter().map(|b| b.meta.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
}

#[tokio::test]
async fn test_create_defaults_name_to_id() {
    let resources = Resources::new(Arc::new(MemoryStore::new()));
    let mut ns = Namespace::new(
        Meta {
            name: String::new(),
            ..Meta::grouped("g1", "ns1")
        },
        Default::default(),
    );
    resources.create(&mut ns).await.unwrap();
    assert_eq!(ns.meta.name, "ns1");
}

#[tokio::test]
async fn test_create_rejects_bad_segments() {
    let resources = Resources::new(Arc::new(MemoryStore::new()));
    let mut bs = BlockStorage::new(Meta::namespaced("g1", "", "bs1"), Default::default());
    let err = resources.create(&mut bs).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidKey(_)));

    let mut group = Group::new(Meta::cluster("a/b"), Default::default());
    assert!(resources.create(&mut group).await.is_err());
}

#[tokio::test]
async fn test_update_rejects_name_change() {
    let resources = Resources::new(Arc::new(MemoryStore::new()));
    let mut bs = block_storage("ns1", "bs1");
    resources.create(&mut bs).await.unwrap();

    bs.meta.name = "renamed".to_string();
    let err = resources.update(&mut bs).await.unwrap_err();
    assert!(matches!(err, StoreError::ImmutableField { field: "name", .. }));
}

#[tokio::test]
async fn test_update_does_not_resurrect_removed_resource() {
    let resources = Resources::new(Arc::new(MemoryStore::new()));
    let mut bs = block_storage("ns1", "bs1");
    resources.create(&mut bs).await.unwrap();
    resources.remove::<BlockStorage>("g1", "ns1", "bs1").await.unwrap();

    bs.spec.request_size = "1G".to_string();
    let err = resources.update(&mut bs).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(resources
        .find::<BlockStorage>("g1", "ns1", "bs1")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_delete_state_marks_once() {
    let resources = Resources::new(Arc::new(MemoryStore::new()));
    let mut node = Node::new(
        Meta::cluster("node-a"),
        NodeSpec {
            limit_vcpus: 8,
            limit_memory_mib: 16384,
        },
    );
    resources.create(&mut node).await.unwrap();

    resources.delete_state::<Node>("", "", "node-a").await.unwrap();
    let first: Node = resources.get("", "", "node-a").await.unwrap();
    assert!(first.meta.is_deleting());
    assert_eq!(first.meta.resource_hash, first.content_hash().unwrap().as_str());

    resources.delete_state::<Node>("", "", "node-a").await.unwrap();
    let second: Node = resources.get("", "", "node-a").await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_list_skips_undecodable_entries() {
    let store = Arc::new(MemoryStore::new());
    let resources = Resources::new(store.clone());
    resources.create(&mut block_storage("ns1", "good")).await.unwrap();
    store
        .put("blockstorage/g1/ns1/bad", b"not json".to_vec())
        .await
        .unwrap();

    let listed: Vec<BlockStorage> = resources.list("g1", "ns1").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].meta.id, "good");
}

#[tokio::test]
async fn test_list_all_walks_groups_and_namespaces() {
    let resources = Resources::new(Arc::new(MemoryStore::new()));
    resources
        .create(&mut Group::new(Meta::cluster("g1"), Default::default()))
        .await
        .unwrap();
    for ns in ["ns1", "ns2"] {
        resources
            .create(&mut Namespace::new(Meta::grouped("g1", ns), Default::default()))
            .await
            .unwrap();
        resources.create(&mut block_storage(ns, "bs")).await.unwrap();
    }
    // Orphan under a namespace that was never registered.
    resources.create(&mut block_storage("orphaned", "bs")).await.unwrap();

    let all: Vec<BlockStorage> = resources.list_all().await.unwrap();
    let mut namespaces: Vec<_> = all.iter().map(|b| b.meta.namespace.as_str()).collect();
    namespaces.sort();
    assert_eq!(namespaces, vec!["ns1", "ns2"]);
}
