//! VirtualMachine power state.
//!
//! The desired state is `spec.action_state`; the hypervisor is asked every
//! pass, so a VM process that died on its own is started again.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_networking::bridge_name;
use fleet_resources::{ActionState, BlockStorage, VirtualMachine, VmState};
use tracing::info;

use crate::engine::{Controller, ControllerError, Outcome, PassContext};
use crate::host::{Hypervisor, VmDisk, VmLaunch, VmNic};
use crate::storage::StorageBackend;

pub struct VmController {
    hypervisor: Arc<dyn Hypervisor>,
}

impl VmController {
    pub fn new(hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self { hypervisor }
    }

    /// Resolve disks and NICs. Every volume must be ready.
    async fn launch_spec(
        ctx: &PassContext,
        vm: &VirtualMachine,
    ) -> Result<VmLaunch, ControllerError> {
        let (group, namespace) = (vm.meta.group.as_str(), vm.meta.namespace.as_str());

        let mut disks = Vec::with_capacity(vm.spec.block_storage_ids.len());
        for id in &vm.spec.block_storage_ids {
            let bs: BlockStorage = ctx
                .resources
                .find(group, namespace, id)
                .await?
                .ok_or_else(|| ControllerError::Dependency(format!("block storage {}", id)))?;
            if !bs.status.state.is_ready() {
                return Err(ControllerError::Dependency(format!(
                    "block storage {} ({:?})",
                    id, bs.status.state
                )));
            }
            disks.push(match StorageBackend::of(&bs.meta) {
                StorageBackend::Local => VmDisk::Local(bs.status.path),
                StorageBackend::Object => VmDisk::Object(bs.status.path),
            });
        }

        let nics = vm
            .spec
            .nics
            .iter()
            .map(|nic| VmNic {
                bridge: bridge_name(group, namespace, &nic.network),
                mac: nic.mac.clone(),
            })
            .collect();

        Ok(VmLaunch {
            uuid: vm.spec.uuid,
            name: vm.meta.name.clone(),
            vcpus: vm.spec.vcpus,
            memory_mib: vm.spec.memory_mib,
            disks,
            nics,
        })
    }

    /// Stop the VM and report what is left.
    async fn power_off(&self, vm: &VirtualMachine) -> Result<VmState, ControllerError> {
        let uuid = vm.spec.uuid;
        if self.hypervisor.is_running(uuid).await? {
            info!(vm = %vm.meta.id, uuid = %uuid, "Stopping VM");
            self.hypervisor.stop(uuid).await?;
        }
        Ok(if self.hypervisor.is_running(uuid).await? {
            VmState::Stopping
        } else {
            VmState::Stopped
        })
    }
}

#[async_trait]
impl Controller for VmController {
    type Kind = VirtualMachine;
    const NAME: &'static str = "virtualmachine";

    async fn reconcile(
        &self,
        ctx: &PassContext,
        vm: &mut VirtualMachine,
    ) -> Result<Outcome, ControllerError> {
        if vm.meta.is_deleting() {
            vm.status.state = self.power_off(vm).await?;
            if vm.status.state == VmState::Stopped {
                info!(vm = %vm.meta.id, "VM removed");
                return Ok(Outcome::Removed);
            }
            return Ok(Outcome::Keep);
        }

        match vm.spec.action_state {
            ActionState::PowerOn => {
                let uuid = vm.spec.uuid;
                if !self.hypervisor.is_running(uuid).await? {
                    let launch = Self::launch_spec(ctx, vm).await?;
                    info!(
                        vm = %vm.meta.id,
                        uuid = %uuid,
                        vcpus = launch.vcpus,
                        memory_mib = launch.memory_mib,
                        "Starting VM"
                    );
                    self.hypervisor.start(&launch).await?;
                }
                vm.status.state = VmState::Running;
            }
            ActionState::PowerOff => {
                vm.status.state = self.power_off(vm).await?;
            }
        }
        Ok(Outcome::Keep)
    }
}
