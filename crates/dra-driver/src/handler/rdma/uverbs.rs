use std::path::Path;
use std::sync::Arc;

use api_types::cdi::ContainerEdits;
use api_types::cdi::DeviceNode;
use api_types::cdi::Mount;
use api_types::AllocationInfo;
use api_types::DeviceConfig;
use api_types::DeviceType;
use api_types::RDMA_KIND_UVERBS;
use tracing::info;

use super::mode;
use crate::error::DriverError;
use crate::error::Result;
use crate::handler::DeviceHandler;
use crate::handler::PrepareRequest;
use crate::handler::PrepareResult;
use crate::handler::UnprepareRequest;
use crate::handler::DEFAULT_POOL;
use crate::platform::HostPaths;
use crate::platform::NetnsMode;
use crate::sandbox::RelocationTracker;
use crate::sandbox::Relocator;

const CONTAINER_DEV_INFINIBAND: &str = "/dev/infiniband";
const CONTAINER_SYS_CLASS_INFINIBAND: &str = "/sys/class/infiniband";
const RDMA_CM: &str = "rdma_cm";

/// Exposes a uverbs character device, plus the shared RDMA CM and the
/// matching umad device, to the container.
///
/// In exclusive netns mode the IB device also has to follow the pod into its
/// network namespace; prepare registers that move and release undoes it.
pub struct UverbsHandler {
    paths: HostPaths,
    relocation: Option<(Arc<RelocationTracker>, Arc<Relocator>)>,
    mode: Option<NetnsMode>,
}

impl UverbsHandler {
    pub fn new(paths: HostPaths) -> Self {
        Self {
            paths,
            relocation: None,
            mode: None,
        }
    }

    pub fn with_relocation(mut self, tracker: Arc<RelocationTracker>, relocator: Arc<Relocator>) -> Self {
        self.relocation = Some((tracker, relocator));
        self
    }

    /// Pins the netns mode instead of detecting it.
    pub fn with_mode(mut self, mode: NetnsMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Tracker and relocator when devices must be moved between namespaces.
    fn exclusive_relocation(&self) -> Option<&(Arc<RelocationTracker>, Arc<Relocator>)> {
        let relocation = self.relocation.as_ref()?;
        let mode = match self.mode {
            Some(mode) => mode,
            None => mode::detect_with(relocation.1.rdma().as_ref()),
        };
        (mode == NetnsMode::Exclusive).then_some(relocation)
    }

    fn select_device(&self, request: &PrepareRequest) -> Result<String> {
        let preferred = request
            .allocated_device
            .as_deref()
            .or_else(|| {
                request
                    .config
                    .rdma
                    .as_ref()
                    .and_then(|rdma| rdma.prefer_device.as_deref())
            })
            .filter(|name| !name.is_empty());
        if let Some(name) = preferred {
            return Ok(name.to_string());
        }

        HostPaths::list_prefixed(&self.paths.dev_infiniband, "uverbs")
            .ok()
            .and_then(|names| names.into_iter().next())
            .ok_or_else(|| DriverError::resource("no uverbs device allocated or available"))
    }

    fn char_device(&self, name: &str) -> DeviceNode {
        DeviceNode {
            path: format!("{CONTAINER_DEV_INFINIBAND}/{name}"),
            host_path: Some(self.paths.dev_infiniband.join(name).display().to_string()),
            permissions: Some("rw".to_string()),
        }
    }
}

#[async_trait::async_trait]
impl DeviceHandler for UverbsHandler {
    fn device_type(&self) -> DeviceType {
        DeviceType::Rdma
    }

    fn kinds(&self) -> Vec<&'static str> {
        vec![RDMA_KIND_UVERBS]
    }

    fn validate(&self, _config: &DeviceConfig) -> Result<()> {
        Ok(())
    }

    async fn prepare(&self, request: &PrepareRequest) -> Result<PrepareResult> {
        let device = self.select_device(request)?;
        let dev_path = self.paths.dev_infiniband.join(&device);
        if !dev_path.exists() {
            return Err(DriverError::resource(format!(
                "uverbs device {} not found",
                dev_path.display()
            )));
        }
        let ibdev = self.paths.resolve_ibdev(&device).unwrap_or_default();

        let mut edits = ContainerEdits::default();
        edits.device_nodes.push(self.char_device(&device));
        // Needed by rdma_resolve_addr and friends; shared by all HCAs.
        if self.paths.dev_infiniband.join(RDMA_CM).exists() {
            edits.device_nodes.push(self.char_device(RDMA_CM));
        }
        // umadN usually pairs with uverbsN.
        let umad = device.replacen("uverbs", "umad", 1);
        if self.paths.dev_infiniband.join(&umad).exists() {
            edits.device_nodes.push(self.char_device(&umad));
        }
        if !ibdev.is_empty() {
            let sys_path = self.paths.sys_class_infiniband.join(&ibdev);
            if sys_path.exists() {
                edits.mounts.push(Mount {
                    host_path: sys_path.display().to_string(),
                    container_path: Path::new(CONTAINER_SYS_CLASS_INFINIBAND)
                        .join(&ibdev)
                        .display()
                        .to_string(),
                    options: vec!["ro".to_string(), "bind".to_string()],
                });
            }
        }

        if !ibdev.is_empty() {
            if let Some((tracker, _)) = self.exclusive_relocation() {
                tracker.add_pending(&request.claim_uid, &ibdev);
                info!(
                    %ibdev,
                    claim_uid = %request.claim_uid,
                    "registered pending RDMA netns move"
                );
            }
        }

        info!(%device, %ibdev, claim_uid = %request.claim_uid, "prepared RDMA uverbs device");
        let metadata = [
            ("uverbsDevice", device.clone()),
            ("ibdev", ibdev),
            ("devPath", dev_path.display().to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Ok(PrepareResult {
            pool_name: DEFAULT_POOL.to_string(),
            device_name: device.clone(),
            edits,
            allocation: AllocationInfo {
                device_type: DeviceType::Rdma,
                kind: RDMA_KIND_UVERBS.to_string(),
                claim_uid: request.claim_uid.clone(),
                device_name: device,
                metadata,
            },
        })
    }

    async fn unprepare(&self, request: &UnprepareRequest) -> Result<()> {
        let ibdev = request.allocation.meta("ibdev");
        if !ibdev.is_empty() {
            if let Some((tracker, relocator)) = self.exclusive_relocation() {
                let claim_uid = &request.allocation.claim_uid;
                tracker.remove_pending(claim_uid);
                // Release runs before the sandbox stops, so the pod netns
                // usually still exists and holds the device.
                let active = tracker.remove_active(claim_uid);
                relocator
                    .return_to_host(ibdev, active.as_ref().map(|a| a.netns_path.as_str()))
                    .await;
            }
        }

        info!(
            device = request.allocation.meta("uverbsDevice"),
            claim_uid = %request.claim_uid,
            "released RDMA uverbs device"
        );
        Ok(())
    }
}
