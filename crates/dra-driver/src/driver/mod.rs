//! Claim preparation and release.
//!
//! [`Driver`] is what the kubelet plugin calls into. It keeps one
//! [`AllocationInfo`] per prepared claim, mirrored to sidecar files so that a
//! restarted (or rolling-updated) driver can replay prepares and release
//! claims it did not prepare itself.

pub mod claim;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;

use api_types::AllocationInfo;
use parking_lot::Mutex;
use tracing::error;
use tracing::info;
use tracing::warn;

pub use claim::ResourceClaim;
pub use store::CdiStore;

use crate::error::DriverError;
use crate::error::Result;
use crate::handler::PrepareRequest;
use crate::handler::Registry;
use crate::handler::UnprepareRequest;
use crate::handler::DEFAULT_POOL;

/// Metadata key under which the pool of a prepared device is persisted.
const POOL_NAME_KEY: &str = "poolName";

/// One prepared device as reported to the kubelet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedDevice {
    pub pool_name: String,
    pub device_name: String,
    pub cdi_device_ids: Vec<String>,
}

/// Claim identity passed to release; the claim object itself may be gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRef {
    pub uid: String,
    pub namespace: String,
    pub name: String,
}

pub struct Driver {
    driver_name: String,
    registry: Arc<Registry>,
    store: CdiStore,
    allocations: Mutex<HashMap<String, AllocationInfo>>,
}

impl Driver {
    pub fn new(driver_name: impl Into<String>, registry: Arc<Registry>, store: CdiStore) -> Self {
        Self {
            driver_name: driver_name.into(),
            registry,
            store,
            allocations: Mutex::new(HashMap::new()),
        }
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    /// Prepares every claim independently; one failing claim never affects
    /// the others.
    pub async fn prepare_resource_claims(
        &self,
        claims: &[ResourceClaim],
    ) -> HashMap<String, Result<Vec<PreparedDevice>>> {
        info!(count = claims.len(), "PrepareResourceClaims called");
        // Another instance may have prepared some of these claims.
        self.restore_allocations();

        let mut results = HashMap::with_capacity(claims.len());
        for claim in claims {
            let uid = claim.metadata.uid.clone();
            info!(
                claim_uid = %uid,
                namespace = %claim.metadata.namespace,
                name = %claim.metadata.name,
                "preparing claim"
            );
            let result = self.prepare_claim(claim).await.map(|device| vec![device]);
            if let Err(e) = &result {
                error!(claim_uid = %uid, error = %e, "failed to prepare claim");
            }
            results.insert(uid, result);
        }
        results
    }

    /// Releases every claim independently. Unknown claims are already clean.
    pub async fn unprepare_resource_claims(&self, claims: &[ClaimRef]) -> HashMap<String, Result<()>> {
        info!(count = claims.len(), "UnprepareResourceClaims called");
        self.restore_allocations();

        let mut results = HashMap::with_capacity(claims.len());
        for claim in claims {
            let result = self.unprepare_claim(&claim.uid).await;
            if let Err(e) = &result {
                error!(claim_uid = %claim.uid, error = %e, "failed to unprepare claim");
            }
            results.insert(claim.uid.clone(), result);
        }
        results
    }

    /// Number of claims currently tracked in memory.
    pub fn allocation_count(&self) -> usize {
        self.allocations.lock().len()
    }

    /// Merges the sidecars on disk into the in-memory map.
    pub fn restore_allocations(&self) {
        let restored = self.store.load_allocations();
        if restored.is_empty() {
            return;
        }
        let count = restored.len();
        let mut allocations = self.allocations.lock();
        for allocation in restored {
            allocations.insert(allocation.claim_uid.clone(), allocation);
        }
        info!(count, "restored allocations from disk");
    }

    async fn prepare_claim(&self, claim: &ResourceClaim) -> Result<PreparedDevice> {
        let uid = claim.metadata.uid.as_str();
        if uid.is_empty() {
            return Err(DriverError::config("claim has no UID"));
        }

        let existing = self.allocations.lock().get(uid).cloned();
        if let Some(existing) = existing {
            let cdi_device_id = self
                .store
                .device_id(existing.device_type, &existing.device_name);
            info!(claim_uid = uid, %cdi_device_id, "claim already prepared, replaying");
            return Ok(PreparedDevice {
                pool_name: existing
                    .metadata
                    .get(POOL_NAME_KEY)
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_POOL.to_string()),
                device_name: existing.device_name,
                cdi_device_ids: vec![cdi_device_id],
            });
        }

        let config = claim.device_config(&self.driver_name);
        let allocated_device = claim.allocated_device(&self.driver_name);
        let handler = self.registry.must_get(config.device_type, config.kind())?;
        handler
            .validate(&config)
            .map_err(|e| e.context("config validation failed"))?;

        let mut result = handler
            .prepare(&PrepareRequest {
                claim_uid: uid.to_string(),
                namespace: claim.metadata.namespace.clone(),
                claim_name: claim.metadata.name.clone(),
                allocated_device,
                config,
            })
            .await?;

        let cdi_device_id = match self.store.write_spec(
            uid,
            result.allocation.device_type,
            &result.device_name,
            &result.edits,
        ) {
            Ok(id) => id,
            Err(e) => {
                self.store.remove_spec(uid);
                let undo = UnprepareRequest {
                    claim_uid: uid.to_string(),
                    allocation: result.allocation,
                };
                if let Err(undo_err) = handler.unprepare(&undo).await {
                    warn!(claim_uid = uid, error = %undo_err, "failed to undo prepare after CDI error");
                }
                return Err(e);
            }
        };

        result
            .allocation
            .metadata
            .insert(POOL_NAME_KEY.to_string(), result.pool_name.clone());
        // Losing the sidecar only hurts recovery after a crash; the claim is
        // prepared and tracked in memory either way.
        if let Err(e) = self.store.write_allocation(&result.allocation) {
            warn!(claim_uid = uid, error = %e, "failed to save allocation state");
        }
        self.allocations
            .lock()
            .insert(uid.to_string(), result.allocation);

        info!(
            claim_uid = uid,
            pool = %result.pool_name,
            device = %result.device_name,
            %cdi_device_id,
            "prepared claim"
        );
        Ok(PreparedDevice {
            pool_name: result.pool_name,
            device_name: result.device_name,
            cdi_device_ids: vec![cdi_device_id],
        })
    }

    async fn unprepare_claim(&self, uid: &str) -> Result<()> {
        let Some(allocation) = self.allocations.lock().get(uid).cloned() else {
            warn!(claim_uid = uid, "no tracked allocation for claim, already cleaned up?");
            return Ok(());
        };

        let handler = self
            .registry
            .get(allocation.device_type, &allocation.kind)
            .ok_or_else(|| DriverError::NotFound {
                device_type: allocation.device_type,
                kind: allocation.kind.clone(),
            })?;
        handler
            .unprepare(&UnprepareRequest {
                claim_uid: allocation.claim_uid.clone(),
                allocation,
            })
            .await?;

        self.store.remove(uid);
        self.allocations.lock().remove(uid);
        info!(claim_uid = uid, "unprepared claim");
        Ok(())
    }
}
