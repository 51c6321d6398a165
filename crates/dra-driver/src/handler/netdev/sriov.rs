use std::path::Path;
use std::sync::Arc;

use api_types::DeviceConfig;
use api_types::DeviceType;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::container_name;
use super::net_device_result;
use super::netdev_config;
use super::DEFAULT_CONTAINER_IFNAME;
use crate::error::DriverError;
use crate::error::Result;
use crate::handler::DeviceHandler;
use crate::handler::PrepareRequest;
use crate::handler::PrepareResult;
use crate::handler::UnprepareRequest;
use crate::platform::HostPaths;
use crate::platform::LinkOps;

const KIND: &str = "sriov-vf";

/// Hands an SR-IOV virtual function to the pod.
///
/// The VF normally comes from the scheduler's allocation; without one it is
/// picked from the PF named by `parent`.
pub struct SriovVfHandler {
    links: Arc<dyn LinkOps>,
    paths: HostPaths,
}

impl SriovVfHandler {
    pub fn new(links: Arc<dyn LinkOps>, paths: HostPaths) -> Self {
        Self { links, paths }
    }

    /// Net interface of VF `vf_index` of `pf`, or of the first VF that has one.
    fn find_vf(&self, pf: &str, vf_index: Option<u32>) -> Result<String> {
        let device_dir = self.paths.sys_class_net.join(pf).join("device");

        if let Some(index) = vf_index {
            let net_dir = device_dir.join(format!("virtfn{index}")).join("net");
            return first_entry(&net_dir)?.ok_or_else(|| {
                DriverError::resource(format!("no net device for VF index {index} on PF {pf}"))
            });
        }

        let virtfns = HostPaths::list_prefixed(&device_dir, "virtfn").map_err(|e| {
            DriverError::resource(format!("read PF device dir {}: {e}", device_dir.display()))
        })?;
        for virtfn in virtfns {
            if let Ok(Some(name)) = first_entry(&device_dir.join(virtfn).join("net")) {
                return Ok(name);
            }
        }
        Err(DriverError::resource(format!(
            "no available VFs found on PF {pf}"
        )))
    }
}

fn first_entry(dir: &Path) -> Result<Option<String>> {
    let names = HostPaths::list_prefixed(dir, "")
        .map_err(|e| DriverError::resource(format!("read {}: {e}", dir.display())))?;
    Ok(names.into_iter().next())
}

#[async_trait::async_trait]
impl DeviceHandler for SriovVfHandler {
    fn device_type(&self) -> DeviceType {
        DeviceType::Netdev
    }

    fn kinds(&self) -> Vec<&'static str> {
        vec![KIND]
    }

    fn validate(&self, config: &DeviceConfig) -> Result<()> {
        netdev_config(config, KIND).map(|_| ())
    }

    async fn prepare(&self, request: &PrepareRequest) -> Result<PrepareResult> {
        let config = netdev_config(&request.config, KIND)?;
        let container_name = container_name(config, DEFAULT_CONTAINER_IFNAME);

        let vf = match request.allocated_device.as_deref() {
            Some(device) if !device.is_empty() => device.to_string(),
            _ => {
                let pf = config.parent.as_deref().unwrap_or_default();
                if pf.is_empty() {
                    return Err(DriverError::config(
                        "either an allocated device or parent PF is required for sriov-vf",
                    ));
                }
                self.find_vf(pf, config.vf_index)?
            }
        };

        if !self.links.exists(&vf).await? {
            return Err(DriverError::resource(format!("VF interface {vf} not found")));
        }
        if let Some(mtu) = config.mtu {
            self.links
                .set_mtu(&vf, mtu)
                .await
                .map_err(|e| DriverError::resource(format!("set mtu on VF {vf}: {e}")))?;
        }
        self.links
            .set_up(&vf)
            .await
            .map_err(|e| DriverError::resource(format!("bring up VF {vf}: {e}")))?;

        info!(claim_uid = %request.claim_uid, %vf, "prepared SR-IOV VF");
        Ok(net_device_result(
            KIND,
            &request.claim_uid,
            &vf,
            &container_name,
            [("vfInterface", vf.clone())],
        ))
    }

    async fn unprepare(&self, request: &UnprepareRequest) -> Result<()> {
        let vf = request.allocation.meta("vfInterface");
        if vf.is_empty() {
            return Ok(());
        }
        if !self.links.exists(vf).await? {
            debug!(vf, "SR-IOV VF not found during unprepare");
            return Ok(());
        }
        // VFs belong to the PF; only take them down.
        if let Err(e) = self.links.set_down(vf).await {
            warn!(vf, error = %e, "failed to bring down VF");
        }
        info!(claim_uid = %request.claim_uid, vf, "unprepared SR-IOV VF");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use api_types::NetdevConfig;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::handler::netdev::testing::*;
    use crate::platform::mock::MockLinks;

    fn sysfs_with_vfs(vfs: &[(u32, &str)]) -> (tempfile::TempDir, HostPaths) {
        let root = tempfile::tempdir().expect("temp dir");
        let paths = HostPaths::with_root(root.path());
        let device_dir = paths.sys_class_net.join("ens1f0").join("device");
        fs::create_dir_all(&device_dir).expect("pf dir");
        for (index, name) in vfs {
            let net_dir = device_dir.join(format!("virtfn{index}")).join("net");
            fs::create_dir_all(net_dir.join(name)).expect("vf dir");
        }
        (root, paths)
    }

    fn pf_config(vf_index: Option<u32>) -> NetdevConfig {
        let mut config = netdev(KIND);
        config.parent = Some("ens1f0".to_string());
        config.vf_index = vf_index;
        config
    }

    #[test(tokio::test)]
    async fn allocated_device_wins() {
        let (_root, paths) = sysfs_with_vfs(&[]);
        let links = MockLinks::new().with_link("ens1f0v3");
        let handler = SriovVfHandler::new(Arc::new(links.clone()), paths);
        let mut req = request(netdev(KIND));
        req.allocated_device = Some("ens1f0v3".to_string());

        let result = handler.prepare(&req).await.expect("prepare");

        assert_eq!(result.device_name, "ens1f0v3");
        assert_eq!(result.allocation.meta("vfInterface"), "ens1f0v3");
        assert!(links.link("ens1f0v3").expect("vf").up);
    }

    #[test(tokio::test)]
    async fn picks_vf_by_index_or_first_available() {
        let (_root, paths) = sysfs_with_vfs(&[(0, "ens1f0v0"), (1, "ens1f0v1")]);
        let links = MockLinks::new().with_link("ens1f0v0").with_link("ens1f0v1");
        let handler = SriovVfHandler::new(Arc::new(links), paths);

        let by_index = handler
            .prepare(&request(pf_config(Some(1))))
            .await
            .expect("prepare by index");
        let first = handler
            .prepare(&request(pf_config(None)))
            .await
            .expect("prepare first");

        assert_eq!(by_index.device_name, "ens1f0v1");
        assert_eq!(first.device_name, "ens1f0v0");
    }

    #[test(tokio::test)]
    async fn requires_allocation_or_parent() {
        let (_root, paths) = sysfs_with_vfs(&[]);
        let handler = SriovVfHandler::new(Arc::new(MockLinks::new()), paths);

        let err = handler
            .prepare(&request(netdev(KIND)))
            .await
            .expect_err("nothing to pick from");

        assert!(matches!(err, DriverError::Config { .. }));
    }

    #[test(tokio::test)]
    async fn unprepare_takes_vf_down_and_tolerates_failure() {
        let (_root, paths) = sysfs_with_vfs(&[(0, "ens1f0v0")]);
        let links = MockLinks::new()
            .with_link("ens1f0v0")
            .fail_on("set_down", "ens1f0v0");
        let handler = SriovVfHandler::new(Arc::new(links.clone()), paths);
        let result = handler
            .prepare(&request(pf_config(Some(0))))
            .await
            .expect("prepare");

        handler.unprepare(&unprepare_of(&result)).await.expect("unprepare");

        assert!(links.has("ens1f0v0"));
        assert!(links.calls().contains(&"set_down ens1f0v0".to_string()));
    }
}
