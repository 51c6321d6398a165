use std::sync::Arc;

use api_types::DeviceConfig;
use api_types::DeviceType;
use api_types::NetdevConfig;
use tracing::info;

use super::container_name;
use super::net_device_result;
use super::netdev_config;
use super::required;
use crate::error::DriverError;
use crate::error::Result;
use crate::handler::DeviceHandler;
use crate::handler::PrepareRequest;
use crate::handler::PrepareResult;
use crate::handler::UnprepareRequest;
use crate::platform::LinkOps;

const KIND: &str = "host-device";

/// Hands an existing host interface to the pod. The interface is owned by the
/// node, so release never deletes it.
pub struct HostDeviceHandler {
    links: Arc<dyn LinkOps>,
}

impl HostDeviceHandler {
    pub fn new(links: Arc<dyn LinkOps>) -> Self {
        Self { links }
    }

    fn parse(config: &DeviceConfig) -> Result<(&NetdevConfig, &str)> {
        let netdev = netdev_config(config, KIND)?;
        let host_device = required(netdev.host_device.as_deref(), "hostDevice", KIND)?;
        Ok((netdev, host_device))
    }
}

#[async_trait::async_trait]
impl DeviceHandler for HostDeviceHandler {
    fn device_type(&self) -> DeviceType {
        DeviceType::Netdev
    }

    fn kinds(&self) -> Vec<&'static str> {
        vec![KIND]
    }

    fn validate(&self, config: &DeviceConfig) -> Result<()> {
        Self::parse(config).map(|_| ())
    }

    async fn prepare(&self, request: &PrepareRequest) -> Result<PrepareResult> {
        let (config, host_device) = Self::parse(&request.config)?;
        // Keeps the host name inside the container unless told otherwise.
        let container_name = container_name(config, host_device);

        if !self.links.exists(host_device).await? {
            return Err(DriverError::resource(format!(
                "host interface {host_device:?} not found"
            )));
        }
        if let Some(mtu) = config.mtu {
            self.links
                .set_mtu(host_device, mtu)
                .await
                .map_err(|e| DriverError::resource(format!("set mtu on {host_device}: {e}")))?;
        }

        info!(
            claim_uid = %request.claim_uid,
            host_device,
            %container_name,
            "prepared host device"
        );
        Ok(net_device_result(
            KIND,
            &request.claim_uid,
            host_device,
            &container_name,
            [("hostDevice", host_device.to_string())],
        ))
    }

    async fn unprepare(&self, request: &UnprepareRequest) -> Result<()> {
        info!(
            claim_uid = %request.claim_uid,
            host_device = request.allocation.meta("hostDevice"),
            "released host device"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::handler::netdev::testing::*;
    use crate::platform::mock::MockLinks;

    fn config(host_device: &str) -> NetdevConfig {
        let mut config = netdev(KIND);
        config.host_device = Some(host_device.to_string());
        config
    }

    #[test(tokio::test)]
    async fn keeps_host_name_by_default() {
        let links = MockLinks::new().with_link("ens2f1");
        let handler = HostDeviceHandler::new(Arc::new(links.clone()));
        let mut config = config("ens2f1");
        config.mtu = Some(9000);

        let result = handler.prepare(&request(config)).await.expect("prepare");

        assert_eq!(result.device_name, "ens2f1");
        assert_eq!(result.edits.net_devices[0].name, "ens2f1");
        assert_eq!(result.allocation.meta("hostDevice"), "ens2f1");
        assert_eq!(links.link("ens2f1").and_then(|l| l.mtu), Some(9000));

        handler.unprepare(&unprepare_of(&result)).await.expect("unprepare");
        assert!(links.has("ens2f1"));
    }

    #[test(tokio::test)]
    async fn missing_interface_fails() {
        let handler = HostDeviceHandler::new(Arc::new(MockLinks::new()));

        let err = handler
            .prepare(&request(config("ens9")))
            .await
            .expect_err("interface missing");

        assert!(matches!(err, DriverError::Resource { .. }));
    }

    #[test]
    fn validate_requires_host_device() {
        let handler = HostDeviceHandler::new(Arc::new(MockLinks::new()));

        assert!(handler
            .validate(&DeviceConfig::netdev(netdev(KIND)))
            .is_err());
    }
}
