//! RDMA + netdev composite (RoCE).
//!
//! Prepare runs the sub-handlers as an ordered list of steps, each paired
//! with its undo. When a step fails, the completed steps are undone in
//! reverse order before the error is returned.

use std::collections::BTreeMap;
use std::sync::Arc;

use api_types::cdi::ContainerEdits;
use api_types::AllocationInfo;
use api_types::ComboConfig;
use api_types::DeviceConfig;
use api_types::DeviceType;
use api_types::COMBO_KIND_ROCE;
use api_types::RDMA_KIND_UVERBS;
use tracing::info;
use tracing::warn;

use super::DeviceHandler;
use super::PrepareRequest;
use super::PrepareResult;
use super::UnprepareRequest;
use crate::error::DriverError;
use crate::error::Result;

/// One forward action of the prepare saga. Undoing a step unprepares the
/// allocation its prepare returned.
struct Step<'a> {
    name: &'static str,
    handler: &'a dyn DeviceHandler,
    request: PrepareRequest,
}

/// Runs `steps` in order; on failure undoes the completed ones in reverse.
///
/// Undo failures are logged only: the claim's own release retries them.
async fn run_saga(claim_uid: &str, steps: Vec<Step<'_>>) -> Result<Vec<PrepareResult>> {
    let mut completed: Vec<(&Step<'_>, PrepareResult)> = Vec::with_capacity(steps.len());

    for step in &steps {
        match step.handler.prepare(&step.request).await {
            Ok(result) => completed.push((step, result)),
            Err(e) => {
                for (done, result) in completed.iter().rev() {
                    let undo = UnprepareRequest {
                        claim_uid: claim_uid.to_string(),
                        allocation: result.allocation.clone(),
                    };
                    if let Err(undo_err) = done.handler.unprepare(&undo).await {
                        warn!(
                            claim_uid,
                            step = done.name,
                            error = %undo_err,
                            "rollback failed, resource stays allocated until release"
                        );
                    }
                }
                return Err(e.context(&format!("{} prepare", step.name)));
            }
        }
    }

    Ok(completed.into_iter().map(|(_, result)| result).collect())
}

/// Combo handler pairing a scarce RDMA device with a commodity interface.
pub struct RoceHandler {
    rdma: Arc<dyn DeviceHandler>,
    netdev: Arc<dyn DeviceHandler>,
}

impl RoceHandler {
    pub fn new(rdma: Arc<dyn DeviceHandler>, netdev: Arc<dyn DeviceHandler>) -> Self {
        Self { rdma, netdev }
    }

    fn combo_config(config: &DeviceConfig) -> Result<&ComboConfig> {
        config
            .combo
            .as_ref()
            .ok_or_else(|| DriverError::config("combo config is required for roce"))
    }
}

#[async_trait::async_trait]
impl DeviceHandler for RoceHandler {
    fn device_type(&self) -> DeviceType {
        DeviceType::Combo
    }

    fn kinds(&self) -> Vec<&'static str> {
        vec![COMBO_KIND_ROCE]
    }

    fn validate(&self, config: &DeviceConfig) -> Result<()> {
        Self::combo_config(config).map(|_| ())
    }

    async fn prepare(&self, request: &PrepareRequest) -> Result<PrepareResult> {
        let combo = Self::combo_config(&request.config)?;

        // The scheduler's allocation names the RDMA device; the interface is
        // created fresh.
        let steps = vec![
            Step {
                name: "rdma",
                handler: self.rdma.as_ref(),
                request: PrepareRequest {
                    config: DeviceConfig::rdma(combo.rdma.clone()),
                    ..request.clone()
                },
            },
            Step {
                name: "netdev",
                handler: self.netdev.as_ref(),
                request: PrepareRequest {
                    allocated_device: None,
                    config: DeviceConfig::netdev(combo.netdev.clone()),
                    ..request.clone()
                },
            },
        ];

        let mut results = run_saga(&request.claim_uid, steps).await?.into_iter();
        let (Some(rdma), Some(net)) = (results.next(), results.next()) else {
            return Err(DriverError::resource("roce prepare: missing step result"));
        };

        let mut edits = ContainerEdits::default();
        edits.append(rdma.edits);
        edits.append(net.edits);

        let metadata: BTreeMap<String, String> = [
            ("rdma_device", rdma.device_name.clone()),
            ("net_interface", net.device_name.clone()),
            ("rdma_uverbs_device", rdma.allocation.meta("uverbsDevice").to_string()),
            ("rdma_ibdev", rdma.allocation.meta("ibdev").to_string()),
            ("net_created", net.allocation.meta("createdInterface").to_string()),
            ("net_host_end", net.allocation.meta("hostEnd").to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        info!(
            rdma = %rdma.device_name,
            net = %net.device_name,
            claim_uid = %request.claim_uid,
            "prepared RoCE device"
        );
        Ok(PrepareResult {
            pool_name: rdma.pool_name,
            device_name: rdma.device_name.clone(),
            edits,
            allocation: AllocationInfo {
                device_type: DeviceType::Combo,
                kind: COMBO_KIND_ROCE.to_string(),
                claim_uid: request.claim_uid.clone(),
                device_name: rdma.device_name,
                metadata,
            },
        })
    }

    async fn unprepare(&self, request: &UnprepareRequest) -> Result<()> {
        let alloc = &request.allocation;
        let sub_allocation = |device_type, kind: &str, metadata: [(&str, &str); 2]| AllocationInfo {
            device_type,
            kind: kind.to_string(),
            claim_uid: request.claim_uid.clone(),
            device_name: String::new(),
            metadata: metadata
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };

        // Both sides always run; one failing must not leak the other.
        let sides = [
            (
                "netdev",
                self.netdev.as_ref(),
                sub_allocation(
                    DeviceType::Netdev,
                    "dummy",
                    [
                        ("createdInterface", alloc.meta("net_created")),
                        ("hostEnd", alloc.meta("net_host_end")),
                    ],
                ),
            ),
            (
                "rdma",
                self.rdma.as_ref(),
                sub_allocation(
                    DeviceType::Rdma,
                    RDMA_KIND_UVERBS,
                    [
                        ("uverbsDevice", alloc.meta("rdma_uverbs_device")),
                        ("ibdev", alloc.meta("rdma_ibdev")),
                    ],
                ),
            ),
        ];

        let mut errors = Vec::new();
        for (name, handler, allocation) in sides {
            let sub = UnprepareRequest {
                claim_uid: request.claim_uid.clone(),
                allocation,
            };
            if let Err(e) = handler.unprepare(&sub).await {
                errors.push(e.context(&format!("{name} unprepare")));
            }
        }

        if !errors.is_empty() {
            return Err(DriverError::Aggregate {
                context: "roce unprepare".to_string(),
                errors,
            });
        }
        info!(claim_uid = %request.claim_uid, "unprepared RoCE device");
        Ok(())
    }
}
