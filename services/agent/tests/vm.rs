//! VirtualMachine power state against the mock hypervisor.

mod common;

use std::sync::Arc;

use common::*;
use fleet_agent::host::fake::MockHypervisor;
use fleet_agent::host::{VmDisk, VmNic};
use fleet_agent::vm::VmController;
use fleet_agent::Engine;
use fleet_networking::bridge_name;
use fleet_resources::{
    ActionState, BlockStorage, BlockStorageSpec, BlockStorageState, Meta, Nic, VirtualMachine,
    VirtualMachineSpec, VmState, ANNOTATION_STORAGE_BACKEND,
};
use fleet_store::Resources;
use uuid::Uuid;

const NODE: &str = "node-a";
const BS1_PATH: &str = "/var/lib/fleet/volumes/g1/ns1/bs1.img";

async fn volume(resources: &Resources, id: &str, state: BlockStorageState, path: &str) {
    let mut bs = BlockStorage::new(
        Meta::namespaced(GROUP, NAMESPACE, id).with_node(NODE),
        BlockStorageSpec::default(),
    );
    bs.status.state = state;
    bs.status.path = path.to_string();
    create(resources, bs).await;
}

async fn vm(resources: &Resources, action: ActionState) -> Uuid {
    let uuid = Uuid::new_v4();
    create(
        resources,
        VirtualMachine::new(
            Meta::namespaced(GROUP, NAMESPACE, "vm1").with_node(NODE),
            VirtualMachineSpec {
                uuid,
                vcpus: 2,
                memory_mib: 2048,
                block_storage_ids: vec!["bs1".to_string()],
                nics: vec![Nic {
                    network: "net1".to_string(),
                    address: "10.0.1.10/24".to_string(),
                    mac: "52:54:00:12:34:56".to_string(),
                }],
                action_state: action,
            },
        ),
    )
    .await;
    uuid
}

async fn set_action(resources: &Resources, action: ActionState) {
    let mut vm: VirtualMachine = get(resources, GROUP, NAMESPACE, "vm1").await;
    vm.spec.action_state = action;
    resources.update(&mut vm).await.unwrap();
}

async fn state(resources: &Resources) -> VmState {
    get::<VirtualMachine>(resources, GROUP, NAMESPACE, "vm1")
        .await
        .status
        .state
}

fn setup(resources: &Resources, hypervisor: &Arc<MockHypervisor>) -> Engine<VmController> {
    engine(VmController::new(hypervisor.clone()), resources, NODE)
}

#[tokio::test]
async fn test_power_on_starts_process_with_uuid() {
    let resources = scoped_resources().await;
    let hypervisor = Arc::new(MockHypervisor::new());
    volume(&resources, "bs1", BlockStorageState::Active, BS1_PATH).await;
    let uuid = vm(&resources, ActionState::PowerOn).await;

    let engine = setup(&resources, &hypervisor);
    engine.run_pass().await;

    assert_eq!(state(&resources).await, VmState::Running);
    let launch = hypervisor.launch(uuid).await.unwrap();
    assert_eq!(launch.uuid, uuid);
    assert_eq!(launch.name, "vm1");
    assert_eq!(launch.vcpus, 2);
    assert_eq!(launch.memory_mib, 2048);
    assert_eq!(launch.disks, vec![VmDisk::Local(BS1_PATH.to_string())]);
    assert_eq!(
        launch.nics,
        vec![VmNic {
            bridge: bridge_name(GROUP, NAMESPACE, "net1"),
            mac: "52:54:00:12:34:56".to_string(),
        }]
    );

    let stats = engine.run_pass().await;
    assert_eq!(stats.written, 0);
    assert_eq!(hypervisor.running_count().await, 1);
}

#[tokio::test]
async fn test_power_off_stops_process() {
    let resources = scoped_resources().await;
    let hypervisor = Arc::new(MockHypervisor::new());
    volume(&resources, "bs1", BlockStorageState::Active, BS1_PATH).await;
    let uuid = vm(&resources, ActionState::PowerOn).await;
    let engine = setup(&resources, &hypervisor);
    engine.run_pass().await;

    set_action(&resources, ActionState::PowerOff).await;
    engine.run_pass().await;

    assert_eq!(state(&resources).await, VmState::Stopped);
    assert!(hypervisor.launch(uuid).await.is_none());
}

#[tokio::test]
async fn test_crashed_vm_is_restarted() {
    let resources = scoped_resources().await;
    let hypervisor = Arc::new(MockHypervisor::new());
    volume(&resources, "bs1", BlockStorageState::Active, BS1_PATH).await;
    let uuid = vm(&resources, ActionState::PowerOn).await;
    let engine = setup(&resources, &hypervisor);
    engine.run_pass().await;

    hypervisor.crash(uuid).await;
    assert_eq!(hypervisor.running_count().await, 0);

    engine.run_pass().await;
    assert!(hypervisor.launch(uuid).await.is_some());
    assert_eq!(state(&resources).await, VmState::Running);
}

#[tokio::test]
async fn test_waits_for_ready_volume() {
    let resources = scoped_resources().await;
    let hypervisor = Arc::new(MockHypervisor::new());
    volume(&resources, "bs1", BlockStorageState::Copying, BS1_PATH).await;
    vm(&resources, ActionState::PowerOn).await;
    let engine = setup(&resources, &hypervisor);

    let stats = engine.run_pass().await;
    assert_eq!(stats.failed, 1);
    assert_eq!(state(&resources).await, VmState::Pending);
    assert_eq!(hypervisor.running_count().await, 0);
}

#[tokio::test]
async fn test_missing_volume_blocks_start() {
    let resources = scoped_resources().await;
    let hypervisor = Arc::new(MockHypervisor::new());
    vm(&resources, ActionState::PowerOn).await;

    let stats = setup(&resources, &hypervisor).run_pass().await;
    assert_eq!(stats.failed, 1);
    assert_eq!(hypervisor.running_count().await, 0);
}

#[tokio::test]
async fn test_object_volume_becomes_object_disk() {
    let resources = scoped_resources().await;
    let hypervisor = Arc::new(MockHypervisor::new());
    let mut bs = BlockStorage::new(
        Meta::namespaced(GROUP, NAMESPACE, "bs1")
            .with_node(NODE)
            .with_annotation(ANNOTATION_STORAGE_BACKEND, "object"),
        BlockStorageSpec::default(),
    );
    bs.status.state = BlockStorageState::Used;
    bs.status.path = "fleet/g1.ns1.bs1".to_string();
    create(&resources, bs).await;
    let uuid = vm(&resources, ActionState::PowerOn).await;

    setup(&resources, &hypervisor).run_pass().await;

    let launch = hypervisor.launch(uuid).await.unwrap();
    assert_eq!(launch.disks, vec![VmDisk::Object("fleet/g1.ns1.bs1".to_string())]);
}

#[tokio::test]
async fn test_failed_start_leaves_vm_pending() {
    let resources = scoped_resources().await;
    let hypervisor = Arc::new(MockHypervisor::failing());
    volume(&resources, "bs1", BlockStorageState::Active, BS1_PATH).await;
    vm(&resources, ActionState::PowerOn).await;

    let stats = setup(&resources, &hypervisor).run_pass().await;
    assert_eq!(stats.failed, 1);
    assert_eq!(state(&resources).await, VmState::Pending);
}

#[tokio::test]
async fn test_delete_stops_then_removes() {
    let resources = scoped_resources().await;
    let hypervisor = Arc::new(MockHypervisor::new());
    volume(&resources, "bs1", BlockStorageState::Active, BS1_PATH).await;
    vm(&resources, ActionState::PowerOn).await;
    let engine = setup(&resources, &hypervisor);
    engine.run_pass().await;

    resources
        .delete_state::<VirtualMachine>(GROUP, NAMESPACE, "vm1")
        .await
        .unwrap();
    let stats = engine.run_pass().await;

    assert_eq!(stats.removed, 1);
    assert_eq!(hypervisor.running_count().await, 0);
    assert!(resources
        .find::<VirtualMachine>(GROUP, NAMESPACE, "vm1")
        .await
        .unwrap()
        .is_none());
}
