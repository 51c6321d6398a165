//! Network interface handlers, one per kind.
//!
//! Every kind hands exactly one host interface to the container runtime as a
//! CDI `netDevices` entry; they differ in whether that interface is created,
//! borrowed or carved out of a physical function.

mod dummy;
mod host_device;
mod ipoib;
mod ipvlan;
mod macvlan;
mod sriov;
mod veth;

use std::collections::BTreeMap;
use std::sync::Arc;

use api_types::cdi::ContainerEdits;
use api_types::AllocationInfo;
use api_types::DeviceConfig;
use api_types::DeviceType;
use api_types::NetdevConfig;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub use dummy::DummyHandler;
pub use host_device::HostDeviceHandler;
pub use ipoib::IpoibHandler;
pub use ipvlan::IpvlanHandler;
pub use macvlan::MacvlanHandler;
pub use sriov::SriovVfHandler;
pub use veth::VethHandler;

use super::DeviceHandler;
use super::PrepareResult;
use super::DEFAULT_POOL;
use crate::error::DriverError;
use crate::error::Result;
use crate::platform::HostPaths;
use crate::platform::LinkOps;
use crate::platform::NewLink;

/// Interface name inside the container when none is configured.
pub const DEFAULT_CONTAINER_IFNAME: &str = "eth1";

/// One instance of every netdev handler sharing the same link backend.
pub fn handlers(links: Arc<dyn LinkOps>, paths: HostPaths) -> Vec<Arc<dyn DeviceHandler>> {
    vec![
        Arc::new(DummyHandler::new(links.clone())),
        Arc::new(VethHandler::new(links.clone())),
        Arc::new(MacvlanHandler::new(links.clone())),
        Arc::new(IpvlanHandler::new(links.clone())),
        Arc::new(HostDeviceHandler::new(links.clone())),
        Arc::new(SriovVfHandler::new(links.clone(), paths)),
        Arc::new(IpoibHandler::new(links)),
    ]
}

/// The netdev payload of `config`, required by every netdev kind.
fn netdev_config<'a>(config: &'a DeviceConfig, kind: &str) -> Result<&'a NetdevConfig> {
    config
        .netdev
        .as_ref()
        .ok_or_else(|| DriverError::config(format!("netdev config is required for {kind}")))
}

fn container_name(config: &NetdevConfig, default: &str) -> String {
    match config.interface_name.as_deref() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => default.to_string(),
    }
}

fn required<'a>(value: Option<&'a str>, field: &str, kind: &str) -> Result<&'a str> {
    match value {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(DriverError::config(format!("{field} is required for {kind}"))),
    }
}

/// Result handing `device` to the container as `container_name`.
fn net_device_result(
    kind: &str,
    claim_uid: &str,
    device: &str,
    container_name: &str,
    metadata: impl IntoIterator<Item = (&'static str, String)>,
) -> PrepareResult {
    let mut metadata: BTreeMap<String, String> = metadata
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect();
    metadata.insert("containerName".to_string(), container_name.to_string());

    PrepareResult {
        pool_name: DEFAULT_POOL.to_string(),
        device_name: device.to_string(),
        edits: ContainerEdits::net_device(device, container_name),
        allocation: AllocationInfo {
            device_type: DeviceType::Netdev,
            kind: kind.to_string(),
            claim_uid: claim_uid.to_string(),
            device_name: device.to_string(),
            metadata,
        },
    }
}

/// Creates `link` and brings `up` (the link itself and any peers) up.
///
/// The link is deleted again if any step after creation fails.
async fn create_link(links: &dyn LinkOps, link: &NewLink, up: &[&str]) -> Result<()> {
    links
        .add(link)
        .await
        .map_err(|e| DriverError::resource(format!("create link {}: {e}", link.name)))?;

    for name in up {
        if let Err(e) = links.set_up(name).await {
            if let Err(cleanup) = links.delete(&link.name).await {
                warn!(link = %link.name, error = %cleanup, "failed to remove link after setup error");
            }
            return Err(DriverError::resource(format!("bring up {name}: {e}")));
        }
    }

    info!(link = %link.name, kind = ?link.kind, "created link");
    Ok(())
}

/// Deletes a link created by prepare; empty or already absent is success.
async fn delete_link(links: &dyn LinkOps, name: &str) -> Result<()> {
    if name.is_empty() {
        return Ok(());
    }
    match links.delete(name).await {
        Ok(true) => {
            info!(link = name, "deleted link");
            Ok(())
        }
        Ok(false) => {
            debug!(link = name, "link already removed");
            Ok(())
        }
        Err(e) => Err(DriverError::resource(format!("delete link {name}: {e}"))),
    }
}
