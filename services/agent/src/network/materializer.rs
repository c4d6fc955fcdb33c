use async_trait::async_trait;
use fleet_resources::{
    Meta, Network, NetworkState, Node, NodeNetwork, NodeNetworkSpec, ANNOTATION_NODE,
};
use fleet_store::StoreError;
use tracing::{debug, info};

use crate::engine::{Controller, ControllerError, Outcome, PassContext};

/// Id of the NodeNetwork materializing `network` on `node`.
pub fn node_network_id(network: &str, node: &str) -> String {
    format!("{}-{}", network, node)
}

/// Singleton controller turning each Network into per-node NodeNetworks.
#[derive(Debug, Default)]
pub struct NetworkController;

#[async_trait]
impl Controller for NetworkController {
    type Kind = Network;
    const NAME: &'static str = "network";

    fn owned_by_node(&self) -> bool {
        false
    }

    async fn reconcile(
        &self,
        ctx: &PassContext,
        network: &mut Network,
    ) -> Result<Outcome, ControllerError> {
        let (group, namespace) = (network.meta.group.clone(), network.meta.namespace.clone());
        let children: Vec<NodeNetwork> = ctx
            .resources
            .list::<NodeNetwork>(&group, &namespace)
            .await?
            .into_iter()
            .filter(|nn| nn.spec.network == network.meta.id)
            .collect();

        if network.meta.is_deleting() {
            network.status.state = NetworkState::Deleting;
            for nn in children.iter().filter(|nn| !nn.meta.is_deleting()) {
                ctx.resources
                    .delete_state::<NodeNetwork>(&group, &namespace, &nn.meta.id)
                    .await?;
            }
            if children.is_empty() {
                return Ok(Outcome::Removed);
            }
            return Ok(Outcome::Keep);
        }

        let nodes: Vec<Node> = ctx
            .resources
            .list::<Node>("", "")
            .await?
            .into_iter()
            .filter(|n| !n.meta.is_deleting())
            .collect();

        for node in &nodes {
            let id = node_network_id(&network.meta.id, &node.meta.id);
            if children.iter().any(|nn| nn.meta.id == id) {
                continue;
            }

            let mut meta = Meta::namespaced(&group, &namespace, &id);
            meta.annotations = network.spec.template.annotations.clone();
            meta.annotations
                .insert(ANNOTATION_NODE.to_string(), node.meta.id.clone());

            let mut nn = NodeNetwork::new(
                meta,
                NodeNetworkSpec {
                    network: network.meta.id.clone(),
                    id: network.spec.id,
                    ipv4_cidr: network.spec.ipv4_cidr.clone(),
                    ipv6_cidr: network.spec.ipv6_cidr.clone(),
                },
            );
            match ctx.resources.create(&mut nn).await {
                Ok(()) => info!(
                    network = %network.meta.id,
                    node = %node.meta.id,
                    node_network = %id,
                    "Materialized network on node"
                ),
                Err(StoreError::AlreadyExists(_)) => {
                    debug!(node_network = %id, "NodeNetwork created concurrently")
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut available: Vec<String> = children
            .iter()
            .filter(|nn| nn.status.state == NetworkState::Available)
            .filter_map(|nn| nn.meta.node_affinity().map(str::to_string))
            .collect();
        available.sort();
        available.dedup();

        let complete = !nodes.is_empty()
            && nodes
                .iter()
                .all(|n| available.binary_search(&n.meta.id).is_ok());

        network.status.state = if complete {
            NetworkState::Available
        } else {
            NetworkState::Pending
        };
        network.status.nodes = available;

        Ok(Outcome::Keep)
    }
}
