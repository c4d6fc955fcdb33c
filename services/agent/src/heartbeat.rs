//! Node registration and liveness.
//!
//! The agent registers its own Node on the first pass, then keeps it Ready,
//! reports the capacity claimed by powered-on VMs pinned to it, and refreshes
//! `last_heartbeat` once per heartbeat period. Allocation only changes the
//! stored hash when it actually moves, so an idle node writes once a period.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fleet_resources::{ActionState, Meta, Node, NodeSpec, NodeState, VirtualMachine};
use fleet_store::{Resources, StoreError};
use tracing::{debug, info};

use crate::engine::{Controller, ControllerError, Outcome, PassContext};

pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

pub struct NodeHeartbeat {
    limits: NodeSpec,
    period: Duration,
    registered: AtomicBool,
}

impl NodeHeartbeat {
    pub fn new(limits: NodeSpec, period: Duration) -> Self {
        Self {
            limits,
            period,
            registered: AtomicBool::new(false),
        }
    }

    fn is_stale(&self, node: &Node) -> bool {
        match node.status.last_heartbeat {
            None => true,
            // A timestamp in the future is treated as stale too.
            Some(last) => (Utc::now() - last)
                .to_std()
                .map(|age| age >= self.period)
                .unwrap_or(true),
        }
    }
}

#[async_trait]
impl Controller for NodeHeartbeat {
    type Kind = Node;
    const NAME: &'static str = "node";

    async fn prepare(&self, ctx: &PassContext) -> Result<(), ControllerError> {
        if self.registered.load(Ordering::Acquire) {
            return Ok(());
        }

        match ctx.resources.find::<Node>("", "", &ctx.node).await? {
            Some(mut node) if node.spec != self.limits => {
                node.spec = self.limits.clone();
                ctx.resources.update(&mut node).await?;
                info!(node = %ctx.node, "Node limits updated");
            }
            Some(_) => {}
            None => {
                let meta = Meta::cluster(&ctx.node).with_node(&ctx.node);
                let mut node = Node::new(meta, self.limits.clone());
                match ctx.resources.create(&mut node).await {
                    Ok(()) => info!(
                        node = %ctx.node,
                        limit_vcpus = self.limits.limit_vcpus,
                        limit_memory_mib = self.limits.limit_memory_mib,
                        "Node registered"
                    ),
                    Err(StoreError::AlreadyExists(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        self.registered.store(true, Ordering::Release);
        Ok(())
    }

    async fn reconcile(
        &self,
        ctx: &PassContext,
        node: &mut Node,
    ) -> Result<Outcome, ControllerError> {
        if node.meta.is_deleting() {
            info!(node = %node.meta.id, "Node deregistered");
            return Ok(Outcome::Removed);
        }

        let vms = ctx.resources.list_all::<VirtualMachine>().await?;
        let (vcpus, memory_mib) = vms
            .iter()
            .filter(|vm| {
                vm.meta.node_affinity() == Some(node.meta.id.as_str())
                    && !vm.meta.is_deleting()
                    && vm.spec.action_state == ActionState::PowerOn
            })
            .fold((0u32, 0u64), |(c, m), vm| {
                (c.saturating_add(vm.spec.vcpus), m.saturating_add(vm.spec.memory_mib))
            });

        node.status.state = NodeState::Ready;
        node.status.allocated_vcpus = vcpus;
        node.status.allocated_memory_mib = memory_mib;

        if self.is_stale(node) {
            node.status.last_heartbeat = Some(Utc::now());
            debug!(node = %node.meta.id, vcpus, memory_mib, "Heartbeat");
        }
        Ok(Outcome::Keep)
    }
}

/// Mark `node` NotReady on shutdown. A missing Node is not an error.
pub async fn mark_not_ready(resources: &Resources, node: &str) -> Result<(), StoreError> {
    let Some(mut record) = resources.find::<Node>("", "", node).await? else {
        return Ok(());
    };
    if record.status.state == NodeState::NotReady {
        return Ok(());
    }
    record.status.state = NodeState::NotReady;
    resources.update(&mut record).await?;
    info!(node = %node, "Node marked not ready");
    Ok(())
}
