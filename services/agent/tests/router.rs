//! VirtualRouter namespaces against the fake network host.

mod common;

use std::sync::Arc;

use common::*;
use fleet_agent::host::fake::FakeNetworkHost;
use fleet_agent::host::{FirewallRule, NetworkHost};
use fleet_agent::router::VirtualRouterController;
use fleet_agent::Engine;
use fleet_networking::{bridge_name, netns_name, VethPair};
use fleet_resources::{
    DnatRule, Meta, NatRule, Nic, RouterState, VirtualRouter, VirtualRouterSpec,
    ANNOTATION_EXTERNAL_BRIDGE,
};
use fleet_store::Resources;

const NODE: &str = "node-a";
const EXTERNAL_BRIDGE: &str = "br-ext";

fn spec() -> VirtualRouterSpec {
    VirtualRouterSpec {
        external_gateway: "203.0.113.1".to_string(),
        external_ip: "203.0.113.10/24".to_string(),
        nics: vec![Nic {
            network: "net1".to_string(),
            address: "10.0.1.1/24".to_string(),
            mac: String::new(),
        }],
        nat_rules: vec![NatRule {
            source: "10.0.1.0/24".to_string(),
            translated: "203.0.113.10".to_string(),
        }],
        dnat_rules: vec![DnatRule {
            protocol: "tcp".to_string(),
            external_port: 8080,
            internal_address: "10.0.1.10".to_string(),
            internal_port: 80,
        }],
    }
}

async fn host() -> Arc<FakeNetworkHost> {
    let host = Arc::new(FakeNetworkHost::new());
    host.create_bridge(EXTERNAL_BRIDGE).await.unwrap();
    host.create_bridge(&bridge_name(GROUP, NAMESPACE, "net1"))
        .await
        .unwrap();
    host
}

async fn setup(external_bridge: &str) -> (Resources, Arc<FakeNetworkHost>, Engine<VirtualRouterController>) {
    let resources = scoped_resources().await;
    let host = host().await;
    let engine = engine(
        VirtualRouterController::new(host.clone(), external_bridge),
        &resources,
        NODE,
    );
    (resources, host, engine)
}

async fn router(resources: &Resources, meta: Meta) {
    create(resources, VirtualRouter::new(meta, spec())).await;
}

fn router_meta() -> Meta {
    Meta::namespaced(GROUP, NAMESPACE, "rt1").with_node(NODE)
}

#[tokio::test]
async fn test_router_is_built() {
    let (resources, host, engine) = setup(EXTERNAL_BRIDGE).await;
    router(&resources, router_meta()).await;

    let stats = engine.run_pass().await;
    assert_eq!(stats.failed, 0);

    let netns = netns_name(GROUP, NAMESPACE, "rt1");
    let rt: VirtualRouter = get(&resources, GROUP, NAMESPACE, "rt1").await;
    assert_eq!(rt.status.state, RouterState::Running);
    assert_eq!(rt.status.netns, netns);
    assert_eq!(host.namespaces().await, vec![netns.clone()]);

    let ext = VethPair::for_router(GROUP, NAMESPACE, "rt1", "ext");
    let outside = host.link(None, &ext.outside).await.unwrap();
    assert_eq!(outside.master.as_deref(), Some(EXTERNAL_BRIDGE));
    assert!(outside.up);
    let inside = host.link(Some(&netns), &ext.inside).await.unwrap();
    assert_eq!(inside.addresses, vec!["203.0.113.10/24".to_string()]);
    assert!(inside.up);
    assert!(host.link(Some(&netns), "lo").await.unwrap().up);

    let nic = VethPair::for_router(GROUP, NAMESPACE, "rt1", "nic0");
    assert_eq!(
        host.link(None, &nic.outside).await.unwrap().master,
        Some(bridge_name(GROUP, NAMESPACE, "net1"))
    );
    assert_eq!(
        host.link(Some(&netns), &nic.inside).await.unwrap().addresses,
        vec!["10.0.1.1/24".to_string()]
    );

    assert!(host.forwarding(&netns).await);
    assert_eq!(host.route(&netns).await.as_deref(), Some("203.0.113.1"));
    assert_eq!(
        host.rules(Some(&netns)).await,
        vec![
            FirewallRule::masquerade_out("10.0.1.0/24", &ext.inside),
            FirewallRule::snat("10.0.1.0/24", &ext.inside, "203.0.113.10"),
            FirewallRule::dnat(&ext.inside, "tcp", 8080, "10.0.1.10", 80),
        ]
    );
    assert!(host.rules(None).await.is_empty());
}

#[tokio::test]
async fn test_converged_router_is_untouched() {
    let (resources, host, engine) = setup(EXTERNAL_BRIDGE).await;
    router(&resources, router_meta()).await;
    engine.run_pass().await;

    let mutations = host.mutations().await;
    let stats = engine.run_pass().await;

    assert_eq!(stats.written, 0);
    assert_eq!(stats.unchanged, 1);
    assert_eq!(host.mutations().await, mutations);
}

#[tokio::test]
async fn test_interrupted_setup_converges() {
    let (resources, host, engine) = setup(EXTERNAL_BRIDGE).await;
    router(&resources, router_meta()).await;

    host.fail("enable_forwarding").await;
    let stats = engine.run_pass().await;
    assert_eq!(stats.failed, 1);
    let rt: VirtualRouter = get(&resources, GROUP, NAMESPACE, "rt1").await;
    assert_eq!(rt.status.state, RouterState::Pending);

    // Work done before the failure stays in place.
    let netns = netns_name(GROUP, NAMESPACE, "rt1");
    assert_eq!(host.rules(Some(&netns)).await.len(), 1);

    host.clear_failures().await;
    let stats = engine.run_pass().await;
    assert_eq!(stats.failed, 0);
    let rt: VirtualRouter = get(&resources, GROUP, NAMESPACE, "rt1").await;
    assert_eq!(rt.status.state, RouterState::Running);
    assert_eq!(host.rules(Some(&netns)).await.len(), 3);
}

#[tokio::test]
async fn test_dropped_nic_and_rules_are_removed() {
    let (resources, host, engine) = setup(EXTERNAL_BRIDGE).await;
    host.create_bridge(&bridge_name(GROUP, NAMESPACE, "net2"))
        .await
        .unwrap();
    let mut wide = spec();
    wide.nics.push(Nic {
        network: "net2".to_string(),
        address: "10.0.2.1/24".to_string(),
        mac: String::new(),
    });
    create(&resources, VirtualRouter::new(router_meta(), wide)).await;
    engine.run_pass().await;

    let netns = netns_name(GROUP, NAMESPACE, "rt1");
    let ext = VethPair::for_router(GROUP, NAMESPACE, "rt1", "ext");
    let nic1 = VethPair::for_router(GROUP, NAMESPACE, "rt1", "nic1");
    assert!(host.link(None, &nic1.outside).await.is_some());
    assert_eq!(host.rules(Some(&netns)).await.len(), 4);

    // Drop the second NIC and the DNAT rule, and move the external address.
    let mut rt: VirtualRouter = get(&resources, GROUP, NAMESPACE, "rt1").await;
    rt.spec = spec();
    rt.spec.dnat_rules.clear();
    rt.spec.external_ip = "203.0.113.20/24".to_string();
    resources.update(&mut rt).await.unwrap();

    let stats = engine.run_pass().await;
    assert_eq!(stats.failed, 0);

    assert!(host.link(None, &nic1.outside).await.is_none());
    assert!(host.link(Some(&netns), &nic1.inside).await.is_none());
    assert_eq!(
        host.link(Some(&netns), &ext.inside).await.unwrap().addresses,
        vec!["203.0.113.20/24".to_string()]
    );
    assert_eq!(
        host.rules(Some(&netns)).await,
        vec![
            FirewallRule::masquerade_out("10.0.1.0/24", &ext.inside),
            FirewallRule::snat("10.0.1.0/24", &ext.inside, "203.0.113.10"),
        ]
    );

    let rt: VirtualRouter = get(&resources, GROUP, NAMESPACE, "rt1").await;
    assert_eq!(rt.status.addresses.len(), 2);
    assert_eq!(rt.status.rules.len(), 2);

    // Converged again.
    let mutations = host.mutations().await;
    assert_eq!(engine.run_pass().await.written, 0);
    assert_eq!(host.mutations().await, mutations);
}

#[tokio::test]
async fn test_veth_left_in_root_namespace_is_moved() {
    let (resources, host, engine) = setup(EXTERNAL_BRIDGE).await;
    router(&resources, router_meta()).await;

    // A previous pass died between creating the pair and moving it.
    let netns = netns_name(GROUP, NAMESPACE, "rt1");
    let ext = VethPair::for_router(GROUP, NAMESPACE, "rt1", "ext");
    host.create_netns(&netns).await.unwrap();
    host.create_veth(&ext.outside, &ext.inside).await.unwrap();

    let stats = engine.run_pass().await;
    assert_eq!(stats.failed, 0);
    assert!(host.link(None, &ext.inside).await.is_none());
    assert!(host.link(Some(&netns), &ext.inside).await.is_some());
}

#[tokio::test]
async fn test_external_bridge_annotation_and_missing_config() {
    let (resources, host, engine) = setup("").await;
    router(&resources, router_meta()).await;

    let stats = engine.run_pass().await;
    assert_eq!(stats.failed, 1);
    assert!(host.namespaces().await.is_empty());

    let mut rt: VirtualRouter = get(&resources, GROUP, NAMESPACE, "rt1").await;
    rt.meta = rt.meta.with_annotation(ANNOTATION_EXTERNAL_BRIDGE, EXTERNAL_BRIDGE);
    resources.update(&mut rt).await.unwrap();

    let stats = engine.run_pass().await;
    assert_eq!(stats.failed, 0);
    let ext = VethPair::for_router(GROUP, NAMESPACE, "rt1", "ext");
    assert_eq!(
        host.link(None, &ext.outside).await.unwrap().master.as_deref(),
        Some(EXTERNAL_BRIDGE)
    );
}

#[tokio::test]
async fn test_delete_tears_down_namespace_and_ports() {
    let (resources, host, engine) = setup(EXTERNAL_BRIDGE).await;
    router(&resources, router_meta()).await;
    engine.run_pass().await;

    resources
        .delete_state::<VirtualRouter>(GROUP, NAMESPACE, "rt1")
        .await
        .unwrap();
    let stats = engine.run_pass().await;

    assert_eq!(stats.removed, 1);
    assert!(host.namespaces().await.is_empty());
    let mut links = host.links_in(None).await;
    links.sort();
    let mut expected = vec![
        EXTERNAL_BRIDGE.to_string(),
        bridge_name(GROUP, NAMESPACE, "net1"),
    ];
    expected.sort();
    assert_eq!(links, expected);
}
