use std::collections::BTreeMap;

use fleet_resources::{Kind, Nic, NodeNetwork, RouterState, VirtualMachine, VirtualRouter, VmState};
use fleet_store::{Resources, StoreError};

/// Running NICs on this NodeNetwork's node that reference its network,
/// keyed `<kind>/<id>/<nic index>`.
///
/// Pure derived data for display; nothing in the state machine reads it.
pub async fn attached_interfaces(
    resources: &Resources,
    nn: &NodeNetwork,
) -> Result<BTreeMap<String, Nic>, StoreError> {
    let (group, namespace) = (nn.meta.group.as_str(), nn.meta.namespace.as_str());
    let node = nn.meta.node_affinity();
    let mut out = BTreeMap::new();

    let vms = resources.list::<VirtualMachine>(group, namespace).await?;
    for vm in vms
        .iter()
        .filter(|vm| vm.status.state == VmState::Running && vm.meta.node_affinity() == node)
    {
        collect::<VirtualMachine>(&mut out, &vm.meta.id, &vm.spec.nics, &nn.spec.network);
    }

    let routers = resources.list::<VirtualRouter>(group, namespace).await?;
    for router in routers
        .iter()
        .filter(|r| r.status.state == RouterState::Running && r.meta.node_affinity() == node)
    {
        collect::<VirtualRouter>(&mut out, &router.meta.id, &router.spec.nics, &nn.spec.network);
    }

    Ok(out)
}

fn collect<K: Kind>(out: &mut BTreeMap<String, Nic>, id: &str, nics: &[Nic], network: &str) {
    for (index, nic) in nics.iter().enumerate() {
        if nic.network == network {
            out.insert(format!("{}/{}/{}", K::KIND, id, index), nic.clone());
        }
    }
}
