use std::sync::Arc;

use api_types::SandboxEvent;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::annotations::claim_uids;
use super::PendingMove;
use super::RelocationTracker;
use super::Relocator;
use crate::error::DriverError;
use crate::error::Result;
use crate::platform::netns;
use crate::platform::PlatformError;

/// Applies pending RDMA relocations when pod sandboxes start and undoes them
/// when they stop.
pub struct SandboxCoordinator {
    tracker: Arc<RelocationTracker>,
    relocator: Arc<Relocator>,
}

impl SandboxCoordinator {
    pub fn new(tracker: Arc<RelocationTracker>, relocator: Arc<Relocator>) -> Self {
        Self { tracker, relocator }
    }

    /// Moves the pending devices of the sandbox's claims into its namespace.
    ///
    /// Moves that cannot be applied are registered as pending again.
    pub async fn run_pod_sandbox(&self, event: &SandboxEvent) -> Result<()> {
        let claims = claim_uids(&event.annotations);
        if claims.is_empty() {
            return Ok(());
        }

        let moves = self.tracker.consume_pending_for_claims(&claims);
        if moves.is_empty() {
            debug!(pod_uid = %event.pod_uid, "no pending RDMA moves for sandbox");
            return Ok(());
        }

        let Some(netns_path) = event.netns_path.as_deref().filter(|p| !p.is_empty()) else {
            warn!(
                pod = %format!("{}/{}", event.namespace, event.name),
                moves = moves.len(),
                "sandbox has no network namespace, keeping RDMA moves pending"
            );
            self.restore_pending(&moves);
            return Ok(());
        };

        // Opening the namespace and the netlink moves block.
        let relocator = self.relocator.clone();
        let target_path = netns_path.to_string();
        let queued = moves.clone();
        let outcomes = tokio::task::spawn_blocking(move || {
            let target = netns::open(&target_path)?;
            Ok::<_, PlatformError>(
                queued
                    .into_iter()
                    .map(|pending| {
                        let result = relocator.move_into(&pending.ib_dev, &target);
                        (pending, result)
                    })
                    .collect::<Vec<_>>(),
            )
        })
        .await;

        let outcomes = match outcomes {
            Ok(Ok(outcomes)) => outcomes,
            Ok(Err(e)) => {
                self.restore_pending(&moves);
                return Err(e.into());
            }
            Err(e) => {
                self.restore_pending(&moves);
                return Err(DriverError::resource(format!("RDMA move task failed: {e}")));
            }
        };

        for (pending, result) in outcomes {
            match result {
                Ok(()) => {
                    self.tracker.mark_active(
                        &pending.claim_uid,
                        &event.pod_uid,
                        &pending.ib_dev,
                        netns_path,
                    );
                    info!(
                        ib_dev = %pending.ib_dev,
                        claim_uid = %pending.claim_uid,
                        pod_uid = %event.pod_uid,
                        netns = netns_path,
                        "moved RDMA device into pod namespace"
                    );
                }
                Err(e) => {
                    warn!(
                        ib_dev = %pending.ib_dev,
                        claim_uid = %pending.claim_uid,
                        error = %e,
                        "failed to move RDMA device, keeping it pending"
                    );
                    self.tracker.add_pending(&pending.claim_uid, &pending.ib_dev);
                }
            }
        }
        Ok(())
    }

    /// Returns every device still active for the pod to the host namespace.
    ///
    /// Covers pods whose claims were never released, e.g. after a driver
    /// restart. Never fails.
    pub async fn stop_pod_sandbox(&self, event: &SandboxEvent) {
        let moves = self.tracker.remove_active_for_pod(&event.pod_uid);
        for active in moves {
            let pod_netns = if active.netns_path.is_empty() {
                event.netns_path.as_deref()
            } else {
                Some(active.netns_path.as_str())
            };
            info!(
                ib_dev = %active.ib_dev,
                claim_uid = %active.claim_uid,
                pod_uid = %event.pod_uid,
                "returning RDMA device on sandbox stop"
            );
            self.relocator.return_to_host(&active.ib_dev, pod_netns).await;
        }
    }

    fn restore_pending(&self, moves: &[PendingMove]) {
        for pending in moves {
            self.tracker.add_pending(&pending.claim_uid, &pending.ib_dev);
        }
    }
}
