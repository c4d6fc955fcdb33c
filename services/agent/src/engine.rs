//! The reconciliation engine shared by every controller.
//!
//! One [`Engine`] drives one [`Controller`]. Each pass:
//!
//! 1. lists the controller's kind, walking Group -> Namespace as its scope
//!    requires;
//! 2. skips resources pinned to another node (node-owned kinds only;
//!    resources with no node annotation are skipped as well);
//! 3. hands a copy of each resource to the controller, which performs the
//!    physical transition and mutates the copy;
//! 4. writes the copy back only if its hash differs from the one read at
//!    list time, or removes it if the controller says it is gone.
//!
//! A failing resource is logged and counted; the pass moves on.

use std::time::Duration;

use async_trait::async_trait;
use fleet_reconcile::{run_periodic, HashGuard, PassStats};
use fleet_resources::Kind;
use fleet_store::{Resources, StoreError};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::host::HostError;

/// Errors from a single resource transition.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("host error: {0}")]
    Host(#[from] HostError),

    /// A logical conflict recorded on the resource itself. The engine still
    /// persists the mutated copy so the diagnostic is visible.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid resource: {0}")]
    Invalid(String),

    /// A referenced resource is not ready yet; retried next pass.
    #[error("waiting on {0}")]
    Dependency(String),
}

impl ControllerError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<serde_json::Error> for ControllerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Store(StoreError::Serialization(e))
    }
}

/// What the engine should do with a resource after its transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Write the copy back if its hash changed.
    Keep,
    /// Teardown is complete; delete the key.
    Removed,
}

/// Shared state handed to every transition.
#[derive(Clone)]
pub struct PassContext {
    /// This agent's node name.
    pub node: String,
    pub resources: Resources,
}

/// A kind-specific transition.
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    type Kind: Kind;

    /// Loop name used in logs.
    const NAME: &'static str;

    /// Whether resources are filtered by node affinity.
    fn owned_by_node(&self) -> bool {
        true
    }

    /// Runs once at the start of every pass, before listing.
    async fn prepare(&self, _ctx: &PassContext) -> Result<(), ControllerError> {
        Ok(())
    }

    /// Converge one resource, mutating `resource` to its observed state.
    async fn reconcile(
        &self,
        ctx: &PassContext,
        resource: &mut Self::Kind,
    ) -> Result<Outcome, ControllerError>;
}

/// Drives one controller on a fixed interval.
pub struct Engine<C: Controller> {
    controller: C,
    ctx: PassContext,
    interval: Duration,
}

impl<C: Controller> Engine<C> {
    pub fn new(controller: C, ctx: PassContext, interval: Duration) -> Self {
        Self {
            controller,
            ctx,
            interval,
        }
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn context(&self) -> &PassContext {
        &self.ctx
    }

    /// Run passes until shutdown.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        run_periodic(C::NAME, self.interval, shutdown, || async move {
            let stats = self.run_pass().await;
            if stats.written > 0 || stats.removed > 0 || stats.failed > 0 {
                info!(
                    controller = C::NAME,
                    seen = stats.seen,
                    written = stats.written,
                    removed = stats.removed,
                    failed = stats.failed,
                    "Pass complete"
                );
            }
        })
        .await;

        info!(controller = C::NAME, "Controller stopped");
    }

    /// Run a single pass.
    #[instrument(skip(self), fields(controller = C::NAME, node = %self.ctx.node))]
    pub async fn run_pass(&self) -> PassStats {
        let mut stats = PassStats::default();

        if let Err(e) = self.controller.prepare(&self.ctx).await {
            warn!(error = %e, "Pass preparation failed");
        }

        let resources = match self.ctx.resources.list_all::<C::Kind>().await {
            Ok(resources) => resources,
            Err(e) => {
                warn!(error = %e, "Listing failed, skipping pass");
                return stats;
            }
        };

        for resource in resources {
            stats.seen += 1;

            if self.controller.owned_by_node()
                && resource.meta().node_affinity() != Some(self.ctx.node.as_str())
            {
                stats.skipped += 1;
                continue;
            }

            self.reconcile_one(resource, &mut stats).await;
        }

        debug!(
            seen = stats.seen,
            skipped = stats.skipped,
            unchanged = stats.unchanged,
            written = stats.written,
            removed = stats.removed,
            failed = stats.failed,
            "Pass finished"
        );
        stats
    }

    async fn reconcile_one(&self, mut resource: C::Kind, stats: &mut PassStats) {
        let key = resource.key();
        let guard = HashGuard::observe(resource.meta().resource_hash.clone());

        match self.controller.reconcile(&self.ctx, &mut resource).await {
            Ok(Outcome::Keep) => self.write_back(&key, &guard, &mut resource, stats).await,
            Ok(Outcome::Removed) => {
                let meta = resource.meta();
                match self
                    .ctx
                    .resources
                    .remove::<C::Kind>(&meta.group, &meta.namespace, &meta.id)
                    .await
                {
                    Ok(()) => {
                        info!(key = %key, "Resource removed");
                        stats.removed += 1;
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Failed to remove resource");
                        stats.failed += 1;
                    }
                }
            }
            Err(e) if e.is_conflict() => {
                warn!(key = %key, error = %e, "Transition conflict");
                stats.failed += 1;
                self.write_back(&key, &guard, &mut resource, stats).await;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Transition failed");
                stats.failed += 1;
            }
        }
    }

    async fn write_back(
        &self,
        key: &str,
        guard: &HashGuard,
        resource: &mut C::Kind,
        stats: &mut PassStats,
    ) {
        let hash = match resource.content_hash() {
            Ok(hash) => hash,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to hash resource");
                stats.failed += 1;
                return;
            }
        };

        if !guard.is_changed(&hash) {
            stats.unchanged += 1;
            return;
        }

        match self.ctx.resources.update(resource).await {
            Ok(()) => {
                debug!(key = %key, hash = %hash, "Resource written");
                stats.written += 1;
            }
            Err(e) if e.is_not_found() => {
                debug!(key = %key, "Resource removed during pass, dropping write");
                stats.unchanged += 1;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to write resource");
                stats.failed += 1;
            }
        }
    }
}
