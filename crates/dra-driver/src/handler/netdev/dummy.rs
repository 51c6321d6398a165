use std::sync::Arc;

use api_types::DeviceConfig;
use api_types::DeviceType;

use super::container_name;
use super::create_link;
use super::delete_link;
use super::net_device_result;
use super::netdev_config;
use super::DEFAULT_CONTAINER_IFNAME;
use crate::error::Result;
use crate::handler::DeviceHandler;
use crate::handler::PrepareRequest;
use crate::handler::PrepareResult;
use crate::handler::UnprepareRequest;
use crate::platform::link::LinkKind;
use crate::platform::LinkOps;
use crate::platform::NewLink;

const KIND: &str = "dummy";

/// Creates a dummy interface per claim.
pub struct DummyHandler {
    links: Arc<dyn LinkOps>,
}

impl DummyHandler {
    pub fn new(links: Arc<dyn LinkOps>) -> Self {
        Self { links }
    }
}

#[async_trait::async_trait]
impl DeviceHandler for DummyHandler {
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
        let name = format!("dm{}", request.short_uid());
        let container_name = container_name(config, DEFAULT_CONTAINER_IFNAME);

        let link = NewLink::new(&name, LinkKind::Dummy).with_mtu(config.mtu);
        create_link(self.links.as_ref(), &link, &[name.as_str()]).await?;

        Ok(net_device_result(
            KIND,
            &request.claim_uid,
            &name,
            &container_name,
            [("createdInterface", name.clone())],
        ))
    }

    async fn unprepare(&self, request: &UnprepareRequest) -> Result<()> {
        delete_link(self.links.as_ref(), request.allocation.meta("createdInterface")).await
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::handler::netdev::testing::*;
    use crate::platform::mock::MockLinks;

    #[test(tokio::test)]
    async fn prepare_creates_named_dummy() {
        let links = MockLinks::new();
        let handler = DummyHandler::new(Arc::new(links.clone()));
        let mut config = netdev(KIND);
        config.mtu = Some(1400);

        let result = handler.prepare(&request(config)).await.expect("prepare");

        assert_eq!(result.device_name, "dm12345678");
        assert_eq!(result.pool_name, "default");
        assert_eq!(result.allocation.meta("createdInterface"), "dm12345678");
        assert_eq!(result.allocation.meta("containerName"), "eth1");
        assert_eq!(result.edits.net_devices[0].host_interface_name, "dm12345678");
        assert_eq!(result.edits.net_devices[0].name, "eth1");
        let link = links.link("dm12345678").expect("link created");
        assert_eq!(link.mtu, Some(1400));
        assert!(link.up);
    }

    #[test(tokio::test)]
    async fn failed_bring_up_removes_link() {
        let links = MockLinks::new().fail_on("set_up", "dm12345678");
        let handler = DummyHandler::new(Arc::new(links.clone()));

        let err = handler
            .prepare(&request(netdev(KIND)))
            .await
            .expect_err("bring up fails");

        assert!(err.to_string().contains("dm12345678"));
        assert!(!links.has("dm12345678"));
    }

    #[test(tokio::test)]
    async fn unprepare_is_idempotent() {
        let links = MockLinks::new();
        let handler = DummyHandler::new(Arc::new(links.clone()));
        let result = handler.prepare(&request(netdev(KIND))).await.expect("prepare");

        handler.unprepare(&unprepare_of(&result)).await.expect("first unprepare");
        handler.unprepare(&unprepare_of(&result)).await.expect("second unprepare");

        assert!(!links.has("dm12345678"));
    }

    #[test]
    fn validate_requires_payload() {
        let handler = DummyHandler::new(Arc::new(MockLinks::new()));
        let config = DeviceConfig::rdma(Default::default());

        assert!(handler.validate(&config).is_err());
    }
}
