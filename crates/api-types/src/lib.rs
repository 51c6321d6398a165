//! Shared API type definitions
//!
//! Wire formats shared by the DRA driver components: the opaque device
//! configuration carried in ResourceClaims, the allocation sidecar persisted
//! next to every CDI spec, CDI documents themselves, and sandbox lifecycle
//! events.

pub mod cdi;

use std::collections::BTreeMap;

use derive_more::Display;
use serde::Deserialize;
use serde::Serialize;

/// Broad device category, the first level of handler dispatch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[display("netdev")]
    Netdev,
    #[display("rdma")]
    Rdma,
    #[display("combo")]
    Combo,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Netdev => "netdev",
            DeviceType::Rdma => "rdma",
            DeviceType::Combo => "combo",
        }
    }
}

/// Kind served by the RDMA verbs handler.
pub const RDMA_KIND_UVERBS: &str = "uverbs";
/// Kind served by the RDMA + netdev combo handler.
pub const COMBO_KIND_ROCE: &str = "roce";

/// Device configuration parsed from the opaque parameters of a ResourceClaim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netdev: Option<NetdevConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rdma: Option<RdmaConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combo: Option<ComboConfig>,
}

impl DeviceConfig {
    /// Configuration used when a claim carries no opaque parameters for us.
    pub fn default_netdev() -> Self {
        Self {
            device_type: DeviceType::Netdev,
            netdev: Some(NetdevConfig {
                kind: "dummy".to_string(),
                interface_name: Some("eth1".to_string()),
                ..Default::default()
            }),
            rdma: None,
            combo: None,
        }
    }

    pub fn netdev(config: NetdevConfig) -> Self {
        Self {
            device_type: DeviceType::Netdev,
            netdev: Some(config),
            rdma: None,
            combo: None,
        }
    }

    pub fn rdma(config: RdmaConfig) -> Self {
        Self {
            device_type: DeviceType::Rdma,
            netdev: None,
            rdma: Some(config),
            combo: None,
        }
    }

    pub fn combo(config: ComboConfig) -> Self {
        Self {
            device_type: DeviceType::Combo,
            netdev: None,
            rdma: None,
            combo: Some(config),
        }
    }

    /// The kind string used for the second level of handler dispatch.
    ///
    /// Netdev configs name their kind explicitly; RDMA and combo currently
    /// have a single kind each. A netdev config without payload has no kind.
    pub fn kind(&self) -> &str {
        match self.device_type {
            DeviceType::Netdev => self.netdev.as_ref().map_or("", |n| n.kind.as_str()),
            DeviceType::Rdma => RDMA_KIND_UVERBS,
            DeviceType::Combo => COMBO_KIND_ROCE,
        }
    }
}

/// Network interface configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetdevConfig {
    pub kind: String,
    /// Interface name inside the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    /// Parent link for macvlan, ipvlan, ipoib and the PF for sriov-vf.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vf_index: Option<u32>,
    /// Pre-existing host interface handed to the pod (host-device kind).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_device: Option<String>,
    /// IPoIB partition key, e.g. 0x8001.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkey: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RdmaConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefer_device: Option<String>,
}

/// RDMA + netdev pair, e.g. RoCE.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComboConfig {
    #[serde(default)]
    pub rdma: RdmaConfig,
    pub netdev: NetdevConfig,
}

/// Everything a handler needs to undo its own work; persisted as the
/// allocation sidecar and restored after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationInfo {
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub kind: String,
    #[serde(rename = "claimUID")]
    pub claim_uid: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl AllocationInfo {
    /// Metadata value or empty string when the key is absent.
    pub fn meta(&self, key: &str) -> &str {
        self.metadata.get(key).map_or("", String::as_str)
    }
}

/// Pod sandbox lifecycle notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxEvent {
    pub pod_uid: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Path of the sandbox network namespace, e.g. /var/run/netns/cni-...
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netns_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn kind_follows_device_type() {
        let netdev = DeviceConfig::netdev(NetdevConfig {
            kind: "macvlan".to_string(),
            ..Default::default()
        });
        assert_eq!(netdev.kind(), "macvlan");
        assert_eq!(DeviceConfig::rdma(RdmaConfig::default()).kind(), "uverbs");
        assert_eq!(DeviceConfig::combo(ComboConfig::default()).kind(), "roce");

        let empty = DeviceConfig {
            device_type: DeviceType::Netdev,
            netdev: None,
            rdma: None,
            combo: None,
        };
        assert_eq!(empty.kind(), "");
    }

    #[test]
    fn device_type_displays_as_wire_name() {
        for device_type in [DeviceType::Netdev, DeviceType::Rdma, DeviceType::Combo] {
            let wire = serde_json::to_value(device_type).expect("serialize");
            assert_eq!(wire, serde_json::Value::String(device_type.to_string()));
            assert_eq!(device_type.to_string(), device_type.as_str());
        }
    }

    #[test]
    fn parses_combo_config_json() {
        let raw = r#"{
            "type": "combo",
            "combo": {
                "rdma": {"preferDevice": "uverbs1"},
                "netdev": {"kind": "dummy", "interfaceName": "net1", "mtu": 9000}
            }
        }"#;

        let config: DeviceConfig = serde_json::from_str(raw).expect("should parse");

        assert_eq!(config.device_type, DeviceType::Combo);
        let combo = config.combo.expect("combo payload");
        assert_eq!(combo.rdma.prefer_device.as_deref(), Some("uverbs1"));
        assert_eq!(combo.netdev.interface_name.as_deref(), Some("net1"));
        assert_eq!(combo.netdev.mtu, Some(9000));
    }

    #[test]
    fn allocation_info_uses_sidecar_field_names() {
        let mut metadata = BTreeMap::new();
        metadata.insert("createdInterface".to_string(), "dm12345678".to_string());
        let alloc = AllocationInfo {
            device_type: DeviceType::Netdev,
            kind: "dummy".to_string(),
            claim_uid: "12345678-aaaa".to_string(),
            device_name: "dm12345678".to_string(),
            metadata,
        };

        let value = serde_json::to_value(&alloc).expect("should serialize");

        assert_eq!(value["type"], "netdev");
        assert_eq!(value["claimUID"], "12345678-aaaa");
        assert_eq!(value["deviceName"], "dm12345678");
        assert_eq!(value["metadata"]["createdInterface"], "dm12345678");
        assert_eq!(alloc.meta("missing"), "");
    }
}
