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

const KIND: &str = "veth";

/// Creates a veth pair; the container end is handed to the pod and the host
/// end stays behind for host-side plumbing.
pub struct VethHandler {
    links: Arc<dyn LinkOps>,
}

impl VethHandler {
    pub fn new(links: Arc<dyn LinkOps>) -> Self {
        Self { links }
    }
}

#[async_trait::async_trait]
impl DeviceHandler for VethHandler {
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
        let host_end = format!("vh{}", request.short_uid());
        let container_end = format!("vc{}", request.short_uid());
        let container_name = container_name(config, DEFAULT_CONTAINER_IFNAME);

        let link = NewLink::new(
            &host_end,
            LinkKind::Veth {
                peer: container_end.clone(),
            },
        )
        .with_mtu(config.mtu);
        create_link(
            self.links.as_ref(),
            &link,
            &[host_end.as_str(), container_end.as_str()],
        )
        .await?;

        Ok(net_device_result(
            KIND,
            &request.claim_uid,
            &container_end,
            &container_name,
            [
                ("hostEnd", host_end.clone()),
                ("containerEnd", container_end.clone()),
            ],
        ))
    }

    async fn unprepare(&self, request: &UnprepareRequest) -> Result<()> {
        // Removing one end removes the pair.
        delete_link(self.links.as_ref(), request.allocation.meta("hostEnd")).await
    }
}
