//! The parts of a `resource.k8s.io` ResourceClaim the driver reads.

use api_types::DeviceConfig;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceClaim {
    #[serde(default)]
    pub metadata: ClaimMetadata,
    #[serde(default)]
    pub spec: ClaimSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ClaimStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimMetadata {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimSpec {
    #[serde(default)]
    pub devices: DeviceClaim,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceClaim {
    #[serde(default)]
    pub config: Vec<DeviceClaimConfiguration>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceClaimConfiguration {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requests: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opaque: Option<OpaqueDeviceConfiguration>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpaqueDeviceConfiguration {
    pub driver: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<AllocationResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocationResult {
    #[serde(default)]
    pub devices: DeviceAllocationResult,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceAllocationResult {
    #[serde(default)]
    pub results: Vec<DeviceRequestAllocationResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceRequestAllocationResult {
    #[serde(default)]
    pub request: String,
    pub driver: String,
    #[serde(default)]
    pub pool: String,
    pub device: String,
}

impl ResourceClaim {
    /// First opaque config addressed to `driver_name` that parses, or the
    /// default dummy interface.
    pub fn device_config(&self, driver_name: &str) -> DeviceConfig {
        for config in &self.spec.devices.config {
            let Some(opaque) = config.opaque.as_ref() else {
                continue;
            };
            if opaque.driver != driver_name {
                continue;
            }
            match serde_json::from_value::<DeviceConfig>(opaque.parameters.clone()) {
                Ok(parsed) => {
                    info!(
                        device_type = %parsed.device_type,
                        kind = parsed.kind(),
                        "parsed device config from ResourceClaim"
                    );
                    return parsed;
                }
                Err(e) => debug!(error = %e, "could not parse opaque config"),
            }
        }
        DeviceConfig::default_netdev()
    }

    /// Device the scheduler allocated from this driver, if any.
    pub fn allocated_device(&self, driver_name: &str) -> Option<String> {
        let result = self
            .status
            .as_ref()?
            .allocation
            .as_ref()?
            .devices
            .results
            .iter()
            .find(|result| result.driver == driver_name)?;
        info!(
            pool = %result.pool,
            device = %result.device,
            request = %result.request,
            "scheduler allocated device"
        );
        Some(result.device.clone())
    }

    /// Names of the claim's requests satisfied by `driver_name`.
    pub fn request_names(&self, driver_name: &str) -> Vec<String> {
        let Some(allocation) = self.status.as_ref().and_then(|s| s.allocation.as_ref()) else {
            return Vec::new();
        };
        allocation
            .devices
            .results
            .iter()
            .filter(|result| result.driver == driver_name && !result.request.is_empty())
            .map(|result| result.request.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use api_types::DeviceType;
    use similar_asserts::assert_eq;

    use super::*;

    const DRIVER: &str = "dra.example.com";

    fn claim(value: serde_json::Value) -> ResourceClaim {
        serde_json::from_value(value).expect("claim json")
    }

    #[test]
    fn picks_first_parsable_config_for_this_driver() {
        let claim = claim(serde_json::json!({
            "metadata": {"uid": "u1", "namespace": "default", "name": "c"},
            "spec": {"devices": {"config": [
                {"opaque": {"driver": "other.example.com", "parameters": {"type": "rdma"}}},
                {"opaque": {"driver": DRIVER, "parameters": {"type": "bogus"}}},
                {"opaque": {"driver": DRIVER, "parameters": {
                    "type": "netdev",
                    "netdev": {"kind": "macvlan", "parent": "eth0"}
                }}}
            ]}}
        }));

        let config = claim.device_config(DRIVER);

        assert_eq!(config.device_type, DeviceType::Netdev);
        assert_eq!(config.kind(), "macvlan");
    }

    #[test]
    fn falls_back_to_dummy_eth1() {
        let claim = claim(serde_json::json!({"metadata": {"uid": "u1"}}));

        let config = claim.device_config(DRIVER);

        assert_eq!(config, DeviceConfig::default_netdev());
        assert_eq!(
            config.netdev.and_then(|n| n.interface_name).as_deref(),
            Some("eth1")
        );
    }

    #[test]
    fn allocated_device_matches_driver() {
        let claim = claim(serde_json::json!({
            "metadata": {"uid": "u1"},
            "status": {"allocation": {"devices": {"results": [
                {"request": "gpu", "driver": "gpu.example.com", "pool": "n1", "device": "gpu0"},
                {"request": "rdma", "driver": DRIVER, "pool": "n1", "device": "uverbs2"}
            ]}}}
        }));

        assert_eq!(claim.allocated_device(DRIVER).as_deref(), Some("uverbs2"));
        assert_eq!(claim.allocated_device("missing.example.com"), None);
        assert_eq!(ResourceClaim::default().allocated_device(DRIVER), None);
        assert_eq!(claim.request_names(DRIVER), vec!["rdma".to_string()]);
        assert!(ResourceClaim::default().request_names(DRIVER).is_empty());
    }
}
