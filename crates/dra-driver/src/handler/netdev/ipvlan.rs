use std::sync::Arc;

use api_types::DeviceConfig;
use api_types::DeviceType;
use api_types::NetdevConfig;

use super::container_name;
use super::create_link;
use super::delete_link;
use super::net_device_result;
use super::netdev_config;
use super::required;
use super::DEFAULT_CONTAINER_IFNAME;
use crate::error::DriverError;
use crate::error::Result;
use crate::handler::DeviceHandler;
use crate::handler::PrepareRequest;
use crate::handler::PrepareResult;
use crate::handler::UnprepareRequest;
use crate::platform::link::LinkKind;
use crate::platform::link::IpvlanMode;
use crate::platform::LinkOps;
use crate::platform::NewLink;

const KIND: &str = "ipvlan";

/// Creates an ipvlan child of a parent interface.
pub struct IpvlanHandler {
    links: Arc<dyn LinkOps>,
}

impl IpvlanHandler {
    pub fn new(links: Arc<dyn LinkOps>) -> Self {
        Self { links }
    }

    fn parse(config: &DeviceConfig) -> Result<(&NetdevConfig, &str, IpvlanMode)> {
        let netdev = netdev_config(config, KIND)?;
        let parent = required(netdev.parent.as_deref(), "parent", KIND)?;
        let mode = IpvlanMode::parse(netdev.mode.as_deref()).ok_or_else(|| {
            DriverError::config(format!(
                "unsupported ipvlan mode {:?} (want l2 or l3)",
                netdev.mode.as_deref().unwrap_or_default()
            ))
        })?;
        Ok((netdev, parent, mode))
    }
}

#[async_trait::async_trait]
impl DeviceHandler for IpvlanHandler {
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
        let (config, parent, mode) = Self::parse(&request.config)?;
        let name = format!("iv{}", request.short_uid());
        let container_name = container_name(config, DEFAULT_CONTAINER_IFNAME);

        let link = NewLink::new(
            &name,
            LinkKind::Ipvlan {
                parent: parent.to_string(),
                mode,
            },
        )
        .with_mtu(config.mtu);
        create_link(self.links.as_ref(), &link, &[name.as_str()]).await?;

        Ok(net_device_result(
            KIND,
            &request.claim_uid,
            &name,
            &container_name,
            [
                ("createdInterface", name.clone()),
                ("parent", parent.to_string()),
            ],
        ))
    }

    async fn unprepare(&self, request: &UnprepareRequest) -> Result<()> {
        delete_link(self.links.as_ref(), request.allocation.meta("createdInterface")).await
    }
}
