//! Cascading delete for the scoping containers.
//!
//! Deletion requests fan out top-down (Group -> Namespace -> leaves) and
//! completion propagates bottom-up: a container is removed only on a pass
//! where it has no children left. The check is level-triggered and simply
//! re-evaluated every interval.

use async_trait::async_trait;
use fleet_resources::{
    BlockStorage, Group, Kind, Namespace, Network, NodeNetwork, VirtualMachine, VirtualRouter,
};
use fleet_store::Resources;
use tracing::info;

use crate::engine::{Controller, ControllerError, Outcome, PassContext};

/// Mark every live `K` in a scope as deleting. Returns how many `K` exist,
/// deleting or not.
pub(crate) async fn fan_out<K: Kind>(
    resources: &Resources,
    group: &str,
    namespace: &str,
) -> Result<usize, ControllerError> {
    let children = resources.list::<K>(group, namespace).await?;
    for child in &children {
        let meta = child.meta();
        if !meta.is_deleting() {
            info!(kind = K::KIND, id = %meta.id, group, namespace, "Cascading delete");
            resources
                .delete_state::<K>(&meta.group, &meta.namespace, &meta.id)
                .await?;
        }
    }
    Ok(children.len())
}

/// Removes deleting Groups once their Namespaces are gone.
#[derive(Debug, Default)]
pub struct GroupController;

#[async_trait]
impl Controller for GroupController {
    type Kind = Group;
    const NAME: &'static str = "group";

    fn owned_by_node(&self) -> bool {
        false
    }

    async fn reconcile(
        &self,
        ctx: &PassContext,
        group: &mut Group,
    ) -> Result<Outcome, ControllerError> {
        if !group.meta.is_deleting() {
            return Ok(Outcome::Keep);
        }

        let remaining = fan_out::<Namespace>(&ctx.resources, &group.meta.id, "").await?;
        if remaining == 0 {
            return Ok(Outcome::Removed);
        }
        Ok(Outcome::Keep)
    }
}

/// Removes deleting Namespaces once every dependent kind is gone.
#[derive(Debug, Default)]
pub struct NamespaceController;

#[async_trait]
impl Controller for NamespaceController {
    type Kind = Namespace;
    const NAME: &'static str = "namespace";

    fn owned_by_node(&self) -> bool {
        false
    }

    async fn reconcile(
        &self,
        ctx: &PassContext,
        ns: &mut Namespace,
    ) -> Result<Outcome, ControllerError> {
        if !ns.meta.is_deleting() {
            return Ok(Outcome::Keep);
        }

        let (group, id) = (ns.meta.group.as_str(), ns.meta.id.as_str());
        let r = &ctx.resources;
        let remaining = fan_out::<VirtualMachine>(r, group, id).await?
            + fan_out::<BlockStorage>(r, group, id).await?
            + fan_out::<Network>(r, group, id).await?
            + fan_out::<NodeNetwork>(r, group, id).await?
            + fan_out::<VirtualRouter>(r, group, id).await?;

        if remaining == 0 {
            return Ok(Outcome::Removed);
        }
        Ok(Outcome::Keep)
    }
}
