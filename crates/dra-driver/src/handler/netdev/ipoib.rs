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
use crate::error::DriverError;
use crate::error::Result;
use crate::handler::DeviceHandler;
use crate::handler::PrepareRequest;
use crate::handler::PrepareResult;
use crate::handler::UnprepareRequest;
use crate::platform::link::IpoibMode;
use crate::platform::link::LinkKind;
use crate::platform::LinkOps;
use crate::platform::NewLink;

const KIND: &str = "ipoib";
const DEFAULT_IPOIB_IFNAME: &str = "ib1";
/// Full-membership bit of an IB partition key.
const PKEY_FULL_MEMBER: u16 = 0x8000;

/// Creates an IPoIB child interface on a partition of an IB port.
pub struct IpoibHandler {
    links: Arc<dyn LinkOps>,
}

struct IpoibParams<'a> {
    config: &'a NetdevConfig,
    parent: &'a str,
    pkey: u16,
    mode: IpoibMode,
}

impl IpoibHandler {
    pub fn new(links: Arc<dyn LinkOps>) -> Self {
        Self { links }
    }

    fn parse(config: &DeviceConfig) -> Result<IpoibParams<'_>> {
        let netdev = netdev_config(config, KIND)?;
        let parent = required(netdev.parent.as_deref(), "parent", KIND)?;
        let pkey = match netdev.pkey {
            None | Some(0) => return Err(DriverError::config("pkey is required for ipoib")),
            Some(pkey) => u16::try_from(pkey).map_err(|_| {
                DriverError::config(format!("pkey {pkey:#x} does not fit in 16 bits"))
            })?,
        };
        let mode = IpoibMode::parse(netdev.mode.as_deref()).ok_or_else(|| {
            DriverError::config(format!(
                "unsupported ipoib mode {:?} (want datagram or connected)",
                netdev.mode.as_deref().unwrap_or_default()
            ))
        })?;
        Ok(IpoibParams {
            config: netdev,
            parent,
            pkey: pkey | PKEY_FULL_MEMBER,
            mode,
        })
    }
}

#[async_trait::async_trait]
impl DeviceHandler for IpoibHandler {
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
        let params = Self::parse(&request.config)?;
        // Per-claim name; the same pkey may back several claims.
        let name = format!("ib{}", request.short_uid());
        let container_name = container_name(params.config, DEFAULT_IPOIB_IFNAME);

        let link = NewLink::new(
            &name,
            LinkKind::Ipoib {
                parent: params.parent.to_string(),
                pkey: params.pkey,
                mode: params.mode,
            },
        )
        .with_mtu(params.config.mtu);
        create_link(self.links.as_ref(), &link, &[name.as_str()]).await?;

        Ok(net_device_result(
            KIND,
            &request.claim_uid,
            &name,
            &container_name,
            [
                ("createdInterface", name.clone()),
                ("parent", params.parent.to_string()),
                ("pkey", format!("{:#06x}", params.pkey)),
            ],
        ))
    }

    async fn unprepare(&self, request: &UnprepareRequest) -> Result<()> {
        delete_link(self.links.as_ref(), request.allocation.meta("createdInterface")).await
    }
}
