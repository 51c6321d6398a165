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
use crate::platform::link::MacvlanMode;
use crate::platform::LinkOps;
use crate::platform::NewLink;

const KIND: &str = "macvlan";

/// Creates a macvlan child of a parent interface.
pub struct MacvlanHandler {
    links: Arc<dyn LinkOps>,
}

impl MacvlanHandler {
    pub fn new(links: Arc<dyn LinkOps>) -> Self {
        Self { links }
    }

    fn parse(config: &DeviceConfig) -> Result<(&NetdevConfig, &str, MacvlanMode)> {
        let netdev = netdev_config(config, KIND)?;
        let parent = required(netdev.parent.as_deref(), "parent", KIND)?;
        let mode = MacvlanMode::parse(netdev.mode.as_deref()).ok_or_else(|| {
            DriverError::config(format!(
                "unsupported macvlan mode {:?} (want bridge, vepa or private)",
                netdev.mode.as_deref().unwrap_or_default()
            ))
        })?;
        Ok((netdev, parent, mode))
    }
}

#[async_trait::async_trait]
impl DeviceHandler for MacvlanHandler {
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
        let name = format!("mv{}", request.short_uid());
        let container_name = container_name(config, DEFAULT_CONTAINER_IFNAME);

        let link = NewLink::new(
            &name,
            LinkKind::Macvlan {
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
