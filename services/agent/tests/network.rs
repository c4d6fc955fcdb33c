//! Network materialization and the per-node Bridge/VLAN/VXLAN state machine.

mod common;

use std::sync::Arc;

use common::*;
use fleet_agent::host::fake::{FakeNetworkHost, LinkKind};
use fleet_agent::network::{node_network_id, NetworkController, NetworkSettings, NodeNetworkController};
use fleet_networking::{bridge_name, vxlan_name};
use fleet_resources::{
    ActionState, Meta, Network, NetworkSpec, NetworkState, Nic, NodeNetwork, NodeNetworkSpec,
    NodeTemplate, VirtualMachine, VirtualMachineSpec, VmState, ANNOTATION_BRIDGE,
    ANNOTATION_DEFAULT_GATEWAY, ANNOTATION_NETWORK_BACKEND, ANNOTATION_VLAN_DEVICE,
    ANNOTATION_VLAN_INTERFACE,
};
use fleet_store::Resources;
use uuid::Uuid;

const NODE: &str = "node-a";

fn settings() -> NetworkSettings {
    NetworkSettings {
        vlan_device: "eth1".to_string(),
        vxlan_group: "239.1.1.1".to_string(),
        vxlan_device: "eth0".to_string(),
    }
}

fn node_network(id: &str, network: &str, vlan: u32, backend: &str) -> NodeNetwork {
    NodeNetwork::new(
        Meta::namespaced(GROUP, NAMESPACE, id)
            .with_node(NODE)
            .with_annotation(ANNOTATION_NETWORK_BACKEND, backend),
        NodeNetworkSpec {
            network: network.to_string(),
            id: vlan,
            ..Default::default()
        },
    )
}

async fn host() -> Arc<FakeNetworkHost> {
    let host = Arc::new(FakeNetworkHost::new());
    host.add_physical("eth0").await;
    host.add_physical("eth1").await;
    host
}

async fn fetch(resources: &Resources, id: &str) -> NodeNetwork {
    get(resources, GROUP, NAMESPACE, id).await
}

#[tokio::test]
async fn test_network_converges_on_every_node() {
    let resources = scoped_resources().await;
    register_node(&resources, "node-a").await;
    register_node(&resources, "node-b").await;

    let mut template = NodeTemplate::default();
    template
        .annotations
        .insert(ANNOTATION_NETWORK_BACKEND.to_string(), "bridge".to_string());
    create(
        &resources,
        Network::new(
            Meta::namespaced(GROUP, NAMESPACE, "net1"),
            NetworkSpec {
                id: 100,
                ipv4_cidr: Some("10.0.1.0/24".to_string()),
                template,
                ..Default::default()
            },
        ),
    )
    .await;

    let materializer = engine(NetworkController, &resources, "node-a");
    materializer.run_pass().await;

    let children = resources.list::<NodeNetwork>(GROUP, NAMESPACE).await.unwrap();
    assert_eq!(children.len(), 2);

    let expected_bridge = bridge_name(GROUP, NAMESPACE, "net1");
    for node in ["node-a", "node-b"] {
        let host = host().await;
        let stats = engine(NodeNetworkController::new(host.clone(), settings()), &resources, node)
            .run_pass()
            .await;
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.written, 1);
        assert_eq!(host.link(None, &expected_bridge).await.unwrap().kind, LinkKind::Bridge);
    }

    for node in ["node-a", "node-b"] {
        let nn = fetch(&resources, &node_network_id("net1", node)).await;
        assert_eq!(nn.status.state, NetworkState::Available);
        assert_eq!(nn.meta.node_affinity(), Some(node));
        assert_eq!(nn.meta.annotation(ANNOTATION_BRIDGE), Some(expected_bridge.as_str()));
        assert_eq!(nn.spec.ipv4_cidr.as_deref(), Some("10.0.1.0/24"));
    }

    materializer.run_pass().await;
    let network: Network = get(&resources, GROUP, NAMESPACE, "net1").await;
    assert_eq!(network.status.state, NetworkState::Available);
    assert_eq!(network.status.nodes, vec!["node-a", "node-b"]);

    // A converged materializer pass creates and writes nothing.
    let stats = materializer.run_pass().await;
    assert_eq!(stats.written, 0);
    assert_eq!(resources.list::<NodeNetwork>(GROUP, NAMESPACE).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_network_pending_until_every_node_reports() {
    let resources = scoped_resources().await;
    register_node(&resources, "node-a").await;
    register_node(&resources, "node-b").await;
    create(
        &resources,
        Network::new(Meta::namespaced(GROUP, NAMESPACE, "net1"), NetworkSpec { id: 7, ..Default::default() }),
    )
    .await;

    let materializer = engine(NetworkController, &resources, "node-a");
    materializer.run_pass().await;
    engine(NodeNetworkController::new(host().await, settings()), &resources, "node-a")
        .run_pass()
        .await;
    materializer.run_pass().await;

    let network: Network = get(&resources, GROUP, NAMESPACE, "net1").await;
    assert_eq!(network.status.state, NetworkState::Pending);
    assert_eq!(network.status.nodes, vec!["node-a"]);
}

#[tokio::test]
async fn test_vlan_conflict_is_logged_and_blocks_second_network() {
    let resources = scoped_resources().await;
    let host = host().await;
    create(&resources, node_network("net1-node-a", "net1", 100, "vlan")).await;
    let mut loser = node_network("net2-node-a", "net2", 100, "vlan");
    loser.meta = loser.meta.with_annotation(ANNOTATION_DEFAULT_GATEWAY, "10.0.2.1/24");
    create(&resources, loser).await;

    let engine = engine(NodeNetworkController::new(host.clone(), settings()), &resources, NODE);
    let stats = engine.run_pass().await;
    assert_eq!(stats.failed, 1);

    // Nothing is built for the network that lost the VLAN.
    assert!(host.link(None, &bridge_name(GROUP, NAMESPACE, "net2")).await.is_none());
    assert!(host.rules(None).await.is_empty());

    let first = fetch(&resources, "net1-node-a").await;
    assert_eq!(first.status.state, NetworkState::Available);
    assert_eq!(first.meta.annotation(ANNOTATION_VLAN_INTERFACE), Some("eth1.100"));
    let vlan = host.link(None, "eth1.100").await.unwrap();
    assert_eq!(vlan.kind, LinkKind::Vlan { parent: "eth1".to_string(), id: 100 });
    assert_eq!(vlan.master, Some(bridge_name(GROUP, NAMESPACE, "net1")));

    let second = fetch(&resources, "net2-node-a").await;
    assert_eq!(second.status.state, NetworkState::Pending);
    assert_eq!(second.status.logs.len(), 1);
    assert!(second.status.logs[0].message.contains("VLAN 100"));
    assert_eq!(second.status.logs[0].node, NODE);

    // The conflict persists but is not logged again.
    let stats = engine.run_pass().await;
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.written, 0);
    let second = fetch(&resources, "net2-node-a").await;
    assert_eq!(second.status.state, NetworkState::Pending);
    assert_eq!(second.status.logs.len(), 1);
    assert!(host.link(None, &bridge_name(GROUP, NAMESPACE, "net2")).await.is_none());
}

#[tokio::test]
async fn test_vlan_device_annotation_overrides_setting() {
    let resources = scoped_resources().await;
    let host = host().await;
    host.add_physical("bond0").await;
    let mut nn = node_network("net1-node-a", "net1", 42, "vlan");
    nn.meta = nn.meta.with_annotation(ANNOTATION_VLAN_DEVICE, "bond0");
    create(&resources, nn).await;

    engine(NodeNetworkController::new(host.clone(), settings()), &resources, NODE)
        .run_pass()
        .await;

    assert!(host.link(None, "bond0.42").await.is_some());
    assert!(host.link(None, "eth1.42").await.is_none());
}

#[tokio::test]
async fn test_converged_pass_is_idempotent() {
    let resources = scoped_resources().await;
    let host = host().await;
    let mut nn = node_network("net1-node-a", "net1", 100, "vlan");
    nn.meta = nn.meta.with_annotation(ANNOTATION_DEFAULT_GATEWAY, "10.0.1.1/24");
    create(&resources, nn).await;
    create(&resources, node_network("net2-node-a", "net2", 200, "vxlan")).await;

    let engine = engine(NodeNetworkController::new(host.clone(), settings()), &resources, NODE);
    let first = engine.run_pass().await;
    assert_eq!(first.written, 2);
    assert_eq!(first.failed, 0);

    let hash_before = fetch(&resources, "net1-node-a").await.meta.resource_hash;
    let mutations = host.mutations().await;

    let second = engine.run_pass().await;
    assert_eq!(second.written, 0);
    assert_eq!(second.unchanged, 2);
    assert_eq!(host.mutations().await, mutations);
    assert_eq!(fetch(&resources, "net1-node-a").await.meta.resource_hash, hash_before);

    let bridge = bridge_name(GROUP, NAMESPACE, "net1");
    assert_eq!(
        host.link(None, &bridge).await.unwrap().addresses,
        vec!["10.0.1.1/24".to_string()]
    );
    assert_eq!(host.rules(None).await.len(), 1);

    let vx = host
        .link(None, &vxlan_name(GROUP, NAMESPACE, "net2"))
        .await
        .unwrap();
    assert_eq!(
        vx.kind,
        LinkKind::Vxlan {
            vni: 200,
            group: "239.1.1.1".to_string(),
            device: "eth0".to_string()
        }
    );
}

#[tokio::test]
async fn test_failed_device_call_retries_next_pass() {
    let resources = scoped_resources().await;
    let host = host().await;
    create(&resources, node_network("net1-node-a", "net1", 100, "vlan")).await;

    host.fail("create_vlan").await;
    let engine = engine(NodeNetworkController::new(host.clone(), settings()), &resources, NODE);
    let stats = engine.run_pass().await;
    assert_eq!(stats.failed, 1);
    assert_eq!(fetch(&resources, "net1-node-a").await.status.state, NetworkState::Pending);

    host.clear_failures().await;
    let stats = engine.run_pass().await;
    assert_eq!(stats.failed, 0);
    assert_eq!(fetch(&resources, "net1-node-a").await.status.state, NetworkState::Available);
}

#[tokio::test]
async fn test_teardown_removes_devices() {
    let resources = scoped_resources().await;
    let host = host().await;
    let mut nn = node_network("net1-node-a", "net1", 100, "vlan");
    nn.meta = nn.meta.with_annotation(ANNOTATION_DEFAULT_GATEWAY, "10.0.1.1/24");
    create(&resources, nn).await;

    let engine = engine(NodeNetworkController::new(host.clone(), settings()), &resources, NODE);
    engine.run_pass().await;
    assert_eq!(host.rules(None).await.len(), 1);

    resources
        .delete_state::<NodeNetwork>(GROUP, NAMESPACE, "net1-node-a")
        .await
        .unwrap();
    let stats = engine.run_pass().await;
    assert_eq!(stats.removed, 1);

    assert!(host.link(None, "eth1.100").await.is_none());
    assert!(host.link(None, &bridge_name(GROUP, NAMESPACE, "net1")).await.is_none());
    assert!(host.rules(None).await.is_empty());
    assert!(host.link(None, "eth1").await.is_some());
    assert!(resources
        .find::<NodeNetwork>(GROUP, NAMESPACE, "net1-node-a")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_network_delete_waits_for_node_networks() {
    let resources = scoped_resources().await;
    register_node(&resources, NODE).await;
    create(
        &resources,
        Network::new(Meta::namespaced(GROUP, NAMESPACE, "net1"), NetworkSpec { id: 1, ..Default::default() }),
    )
    .await;

    let materializer = engine(NetworkController, &resources, NODE);
    let provisioner = engine(NodeNetworkController::new(host().await, settings()), &resources, NODE);
    materializer.run_pass().await;
    provisioner.run_pass().await;

    resources.delete_state::<Network>(GROUP, NAMESPACE, "net1").await.unwrap();
    let stats = materializer.run_pass().await;
    assert_eq!(stats.removed, 0);
    let network: Network = get(&resources, GROUP, NAMESPACE, "net1").await;
    assert_eq!(network.status.state, NetworkState::Deleting);
    assert!(fetch(&resources, "net1-node-a").await.meta.is_deleting());

    provisioner.run_pass().await;
    let stats = materializer.run_pass().await;
    assert_eq!(stats.removed, 1);
    assert!(resources.list::<Network>(GROUP, NAMESPACE).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_attached_interfaces_follow_running_vms() {
    let resources = scoped_resources().await;
    let host = host().await;
    create(&resources, node_network("net1-node-a", "net1", 100, "bridge")).await;

    let nic = Nic {
        network: "net1".to_string(),
        address: "10.0.1.10/24".to_string(),
        mac: "52:54:00:00:00:01".to_string(),
    };
    let mut vm = VirtualMachine::new(
        Meta::namespaced(GROUP, NAMESPACE, "vm1").with_node(NODE),
        VirtualMachineSpec {
            uuid: Uuid::new_v4(),
            vcpus: 1,
            memory_mib: 256,
            nics: vec![
                Nic {
                    network: "other".to_string(),
                    ..Default::default()
                },
                nic.clone(),
            ],
            action_state: ActionState::PowerOn,
            ..Default::default()
        },
    );
    vm.status.state = VmState::Running;
    create(&resources, vm).await;

    let engine = engine(NodeNetworkController::new(host, settings()), &resources, NODE);
    engine.run_pass().await;

    let nn = fetch(&resources, "net1-node-a").await;
    assert_eq!(nn.status.attached_interfaces.len(), 1);
    assert_eq!(nn.status.attached_interfaces.get("virtualmachine/vm1/1"), Some(&nic));

    let mut vm: VirtualMachine = get(&resources, GROUP, NAMESPACE, "vm1").await;
    vm.status.state = VmState::Stopped;
    resources.update(&mut vm).await.unwrap();

    engine.run_pass().await;
    let nn = fetch(&resources, "net1-node-a").await;
    assert!(nn.status.attached_interfaces.is_empty());
}
