//! ResourceSlice publishing.

use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use kube::api::Patch;
use kube::api::PatchParams;
use serde_json::json;
use serde_json::Value;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::Device;
use crate::kubelet::resource_api::RESOURCE_API_GROUP;
use crate::kubelet::resource_api::RESOURCE_API_VERSION;
use crate::kubelet::resource_api::RESOURCE_SLICE_KIND;
use crate::kubelet::KubeletError;
use crate::kubelet::ResourceApi;

const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Name of the single slice a driver publishes for a node.
pub fn slice_name(node_name: &str, driver_name: &str) -> String {
    format!("{node_name}-{}", driver_name.replace('/', "-")).to_lowercase()
}

/// A node-local ResourceSlice carrying `devices` in one pool named after the
/// node.
pub fn resource_slice(driver_name: &str, node_name: &str, devices: &[Device]) -> Value {
    json!({
        "apiVersion": format!("{RESOURCE_API_GROUP}/{RESOURCE_API_VERSION}"),
        "kind": RESOURCE_SLICE_KIND,
        "metadata": {
            "name": slice_name(node_name, driver_name),
        },
        "spec": {
            "driver": driver_name,
            "nodeName": node_name,
            "pool": {
                "name": node_name,
                "generation": 1,
                "resourceSliceCount": 1,
            },
            "devices": devices,
        },
    })
}

pub struct SlicePublisher {
    api: ResourceApi,
    driver_name: String,
    node_name: String,
}

impl SlicePublisher {
    pub fn new(api: ResourceApi, driver_name: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self {
            api,
            driver_name: driver_name.into(),
            node_name: node_name.into(),
        }
    }

    /// Server-side applies the node's slice.
    pub async fn publish(&self, devices: &[Device]) -> Result<(), Report<KubeletError>> {
        let name = slice_name(&self.node_name, &self.driver_name);
        let slice = resource_slice(&self.driver_name, &self.node_name, devices);
        self.api
            .slices()
            .patch(
                &name,
                &PatchParams::apply(&self.driver_name).force(),
                &Patch::Apply(&slice),
            )
            .await
            .change_context_lazy(|| KubeletError::Publish { name: name.clone() })?;
        info!(slice = %name, devices = devices.len(), "published ResourceSlice");
        Ok(())
    }

    /// Publishes until it succeeds or shutdown is requested.
    pub async fn run(&self, devices: Vec<Device>, cancellation_token: CancellationToken) {
        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("ResourceSlice publishing cancelled");
                    return;
                }
                result = self.publish(&devices) => {
                    match result {
                        Ok(()) => return,
                        Err(e) => {
                            error!("failed to publish resources: {e:?}");
                            tokio::time::sleep(RETRY_INTERVAL).await;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::discovery::DeviceAttribute;

    #[test]
    fn slice_is_one_pool_per_node() {
        let devices = vec![Device {
            name: "netdev-virtual".to_string(),
            attributes: BTreeMap::from([(
                "dra.example.com/kind".to_string(),
                DeviceAttribute::String("virtual".to_string()),
            )]),
            allow_multiple_allocations: Some(true),
        }];

        let slice = resource_slice("dra.example.com", "Node-1", &devices);

        assert_eq!(slice["metadata"]["name"], json!("node-1-dra.example.com"));
        assert_eq!(slice["spec"]["pool"]["name"], json!("Node-1"));
        assert_eq!(slice["spec"]["nodeName"], json!("Node-1"));
        assert_eq!(
            slice["spec"]["devices"][0],
            json!({
                "name": "netdev-virtual",
                "attributes": {"dra.example.com/kind": {"string": "virtual"}},
                "allowMultipleAllocations": true
            })
        );
    }
}
