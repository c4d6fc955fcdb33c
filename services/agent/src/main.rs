//! fleet node agent
//!
//! Runs on every node and reconciles the resources pinned to it (networks,
//! routers, volumes, images, VMs, its own Node) against the host. The
//! cluster-wide controllers (Group, Namespace, Network) can be enabled on
//! any one agent with `FLEET_CONTROLLERS`.

use std::sync::Arc;

use anyhow::{Context, Result};
use fleet_agent::cascade::{GroupController, NamespaceController};
use fleet_agent::config::{Config, ControllerKind};
use fleet_agent::engine::{Controller, Engine, PassContext};
use fleet_agent::heartbeat::{mark_not_ready, NodeHeartbeat};
use fleet_agent::host::{ExecNetworkHost, LocalDiskHost, QemuHypervisor, RbdObjectStore};
use fleet_agent::image::ImageEntityController;
use fleet_agent::network::{NetworkController, NodeNetworkController};
use fleet_agent::router::VirtualRouterController;
use fleet_agent::storage::BlockStorageController;
use fleet_agent::vm::VmController;
use fleet_store::{Resources, SqliteStore};
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn spawn<C: Controller>(
    controller: C,
    ctx: &PassContext,
    config: &Config,
    shutdown: &watch::Receiver<bool>,
) -> JoinHandle<()> {
    let engine = Engine::new(controller, ctx.clone(), config.reconcile_interval);
    let shutdown = shutdown.clone();
    info!(controller = C::NAME, "Starting controller");
    tokio::spawn(async move { engine.run(shutdown).await })
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        node = %config.node_name,
        store_path = %config.store_path.display(),
        interval_ms = config.reconcile_interval.as_millis() as u64,
        controllers = ?config.controllers,
        "Starting fleet agent"
    );

    if let Some(parent) = config.store_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = SqliteStore::open(&config.store_path)
        .with_context(|| format!("opening store at {}", config.store_path.display()))?;

    let ctx = PassContext {
        node: config.node_name.clone(),
        resources: Resources::new(Arc::new(store)),
    };

    let net = Arc::new(ExecNetworkHost::new());
    let disk = Arc::new(LocalDiskHost::new());
    let objects = Arc::new(RbdObjectStore::new());
    let hypervisor = Arc::new(QemuHypervisor::new(&config.qemu_path, &config.run_dir));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    for kind in &config.controllers {
        let handle = match kind {
            ControllerKind::Group => spawn(GroupController, &ctx, &config, &shutdown_rx),
            ControllerKind::Namespace => spawn(NamespaceController, &ctx, &config, &shutdown_rx),
            ControllerKind::Network => spawn(NetworkController, &ctx, &config, &shutdown_rx),
            ControllerKind::NodeNetwork => spawn(
                NodeNetworkController::new(net.clone(), config.network.clone()),
                &ctx,
                &config,
                &shutdown_rx,
            ),
            ControllerKind::VirtualRouter => spawn(
                VirtualRouterController::new(net.clone(), config.external_bridge.clone()),
                &ctx,
                &config,
                &shutdown_rx,
            ),
            ControllerKind::BlockStorage => spawn(
                BlockStorageController::new(
                    disk.clone(),
                    objects.clone(),
                    config.storage.clone(),
                ),
                &ctx,
                &config,
                &shutdown_rx,
            ),
            ControllerKind::ImageEntity => spawn(
                ImageEntityController::new(
                    disk.clone(),
                    objects.clone(),
                    config.storage.clone(),
                ),
                &ctx,
                &config,
                &shutdown_rx,
            ),
            ControllerKind::VirtualMachine => spawn(
                VmController::new(hypervisor.clone()),
                &ctx,
                &config,
                &shutdown_rx,
            ),
            ControllerKind::Node => spawn(
                NodeHeartbeat::new(config.node_limits.clone(), config.heartbeat_period),
                &ctx,
                &config,
                &shutdown_rx,
            ),
        };
        handles.push(handle);
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);

    info!("Waiting for controllers to stop...");
    for result in join_all(handles).await {
        if let Err(e) = result {
            error!(error = %e, "Controller task panicked");
        }
    }

    if config.runs(ControllerKind::Node) {
        if let Err(e) = mark_not_ready(&ctx.resources, &config.node_name).await {
            warn!(error = %e, "Failed to mark node not ready");
        }
    }

    info!("Agent shutdown complete");
    Ok(())
}
