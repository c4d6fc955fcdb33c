//! Engine behaviour with a scripted controller.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use fleet_agent::engine::{Controller, ControllerError, Outcome, PassContext};
use fleet_resources::{
    BlockStorage, BlockStorageSpec, BlockStorageState, Kind, Meta, ANNOTATION_NODE,
};
use fleet_store::Resources;
use tokio::sync::watch;

/// Moves volumes through a fixed script keyed by id.
#[derive(Default)]
struct Scripted {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Controller for Scripted {
    type Kind = BlockStorage;
    const NAME: &'static str = "scripted";

    async fn reconcile(
        &self,
        _ctx: &PassContext,
        bs: &mut BlockStorage,
    ) -> Result<Outcome, ControllerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match bs.meta.id.as_str() {
            "activate" => {
                bs.status.state = BlockStorageState::Active;
                Ok(Outcome::Keep)
            }
            "gone" => Ok(Outcome::Removed),
            "conflict" => {
                bs.status.message = "claimed elsewhere".to_string();
                Err(ControllerError::Conflict("claimed elsewhere".to_string()))
            }
            "broken" => {
                bs.status.message = "should not persist".to_string();
                Err(ControllerError::Invalid("broken".to_string()))
            }
            _ => Ok(Outcome::Keep),
        }
    }
}

async fn volume(resources: &Resources, id: &str, node: Option<&str>) {
    let mut meta = Meta::namespaced(GROUP, NAMESPACE, id);
    if let Some(node) = node {
        meta = meta.with_node(node);
    }
    create(resources, BlockStorage::new(meta, BlockStorageSpec::default())).await;
}

async fn fetch(resources: &Resources, id: &str) -> Option<BlockStorage> {
    resources
        .find::<BlockStorage>(GROUP, NAMESPACE, id)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_pass_outcomes() {
    let resources = scoped_resources().await;
    for id in ["activate", "broken", "conflict", "gone", "idle"] {
        volume(&resources, id, Some("node-a")).await;
    }

    let stats = engine(Scripted::default(), &resources, "node-a").run_pass().await;

    assert_eq!(stats.seen, 5);
    assert_eq!(stats.written, 2);
    assert_eq!(stats.removed, 1);
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.unchanged, 1);

    let activated = fetch(&resources, "activate").await.unwrap();
    assert_eq!(activated.status.state, BlockStorageState::Active);
    assert_eq!(activated.meta.resource_hash, activated.content_hash().unwrap().as_str());

    assert_eq!(
        fetch(&resources, "conflict").await.unwrap().status.message,
        "claimed elsewhere"
    );
    assert!(fetch(&resources, "broken").await.unwrap().status.message.is_empty());
    assert!(fetch(&resources, "gone").await.is_none());
}

#[tokio::test]
async fn test_affinity_filter() {
    let resources = scoped_resources().await;
    volume(&resources, "mine", Some("node-a")).await;
    volume(&resources, "theirs", Some("node-b")).await;
    volume(&resources, "unpinned", None).await;

    let controller = Scripted::default();
    let calls = controller.calls.clone();
    let stats = engine(controller, &resources, "node-a").run_pass().await;

    assert_eq!(stats.seen, 3);
    assert_eq!(stats.skipped, 2);
    assert_eq!(stats.reconciled(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_empty_node_annotation_is_unpinned() {
    let resources = scoped_resources().await;
    let meta = Meta::namespaced(GROUP, NAMESPACE, "blank").with_annotation(ANNOTATION_NODE, "");
    create(&resources, BlockStorage::new(meta, BlockStorageSpec::default())).await;

    let stats = engine(Scripted::default(), &resources, "").run_pass().await;
    assert_eq!(stats.skipped, 1);
}

#[tokio::test]
async fn test_second_pass_writes_nothing() {
    let resources = scoped_resources().await;
    volume(&resources, "activate", Some("node-a")).await;
    let engine = engine(Scripted::default(), &resources, "node-a");

    assert_eq!(engine.run_pass().await.written, 1);
    let hash = fetch(&resources, "activate").await.unwrap().meta.resource_hash;

    let stats = engine.run_pass().await;
    assert_eq!(stats.written, 0);
    assert_eq!(stats.unchanged, 1);
    assert_eq!(fetch(&resources, "activate").await.unwrap().meta.resource_hash, hash);
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let resources = scoped_resources().await;
    volume(&resources, "idle", Some("node-a")).await;

    let controller = Scripted::default();
    let calls = controller.calls.clone();
    let engine = Arc::new(engine(controller, &resources, "node-a"));
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run(rx).await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("engine did not stop")
        .unwrap();

    assert!(calls.load(Ordering::SeqCst) >= 1);
}
