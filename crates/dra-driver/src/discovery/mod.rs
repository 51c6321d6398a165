//! Node device discovery.
//!
//! Physical inventory (SR-IOV VFs, allocatable NICs, uverbs devices) is read
//! from sysfs and `/dev`; virtual kinds are advertised as pools because they
//! are created on demand.

mod publisher;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub use publisher::resource_slice;
pub use publisher::slice_name;
pub use publisher::SlicePublisher;

use crate::platform::HostPaths;
use crate::platform::NetnsMode;

/// Host interfaces that are never advertised.
const SKIPPED_INTERFACES: &[&str] = &["lo", "eth0", "docker0", "cni0"];

/// Name fragments of interfaces that can be handed out whole.
const ALLOCATABLE_PATTERNS: &[&str] = &["vf", "enp", "ens", "ib", "rdma", "veth", "dummy"];

/// One entry of a ResourceSlice `devices` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub name: String,
    pub attributes: BTreeMap<String, DeviceAttribute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_multiple_allocations: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceAttribute {
    String(String),
    Int(i64),
    Bool(bool),
}

/// Builds devices with attributes qualified by the driver name.
struct DeviceBuilder<'a> {
    driver_name: &'a str,
    device: Device,
}

impl<'a> DeviceBuilder<'a> {
    fn new(driver_name: &'a str, name: impl Into<String>) -> Self {
        Self {
            driver_name,
            device: Device {
                name: name.into(),
                attributes: BTreeMap::new(),
                allow_multiple_allocations: None,
            },
        }
    }

    fn string(mut self, key: &str, value: impl Into<String>) -> Self {
        self.device.attributes.insert(
            format!("{}/{key}", self.driver_name),
            DeviceAttribute::String(value.into()),
        );
        self
    }

    fn int(mut self, key: &str, value: i64) -> Self {
        self.device
            .attributes
            .insert(format!("{}/{key}", self.driver_name), DeviceAttribute::Int(value));
        self
    }

    fn shared(mut self) -> Self {
        self.device.allow_multiple_allocations = Some(true);
        self
    }

    fn build(self) -> Device {
        self.device
    }
}

pub struct Discovery {
    driver_name: String,
    paths: HostPaths,
    mode: NetnsMode,
}

impl Discovery {
    pub fn new(driver_name: impl Into<String>, paths: HostPaths, mode: NetnsMode) -> Self {
        Self {
            driver_name: driver_name.into(),
            paths,
            mode,
        }
    }

    /// Every device this node can offer.
    pub fn discover(&self) -> Vec<Device> {
        let net = self.network_devices();
        let rdma = self.rdma_devices();
        let virtual_pools = self.virtual_pools();
        info!(
            total = net.len() + rdma.len() + virtual_pools.len(),
            net = net.len(),
            rdma = rdma.len(),
            virtual_pools = virtual_pools.len(),
            "discovered devices"
        );
        net.into_iter().chain(rdma).chain(virtual_pools).collect()
    }

    fn interfaces(&self) -> Vec<String> {
        match HostPaths::list_prefixed(&self.paths.sys_class_net, "") {
            Ok(names) => names,
            Err(e) => {
                warn!(dir = %self.paths.sys_class_net.display(), error = %e, "failed to list interfaces");
                Vec::new()
            }
        }
    }

    fn network_devices(&self) -> Vec<Device> {
        let mut devices = Vec::new();
        for name in self.interfaces() {
            if SKIPPED_INTERFACES.contains(&name.as_str()) || name.starts_with("veth") {
                continue;
            }
            let device_dir = self.paths.sys_class_net.join(&name).join("device");

            if device_dir.join("physfn").exists() {
                let mut builder = DeviceBuilder::new(&self.driver_name, name.as_str())
                    .string("type", "netdev")
                    .string("kind", "sriov-vf")
                    .string("parent", vf_parent(&device_dir).unwrap_or_default());
                if let Some(pci) = pci_address(&device_dir) {
                    builder = builder.string("pci-address", pci);
                }
                if let Some(node) = numa_node(&device_dir) {
                    builder = builder.int("numa-node", node);
                }
                devices.push(builder.build());
                debug!(vf = %name, "discovered SR-IOV VF");
                continue;
            }

            if ALLOCATABLE_PATTERNS.iter().any(|p| name.contains(p)) {
                devices.push(
                    DeviceBuilder::new(&self.driver_name, format!("netdev-{name}"))
                        .string("type", "netdev")
                        .string("kind", "physical")
                        .string("interface", name.as_str())
                        .build(),
                );
                debug!(interface = %name, "discovered allocatable interface");
            }
        }
        devices
    }

    fn rdma_devices(&self) -> Vec<Device> {
        let names = match HostPaths::list_prefixed(&self.paths.dev_infiniband, "uverbs") {
            Ok(names) => names,
            Err(e) => {
                debug!(error = %e, "no RDMA devices found");
                return Vec::new();
            }
        };

        names
            .into_iter()
            .map(|name| {
                let mut builder = DeviceBuilder::new(&self.driver_name, name.as_str())
                    .string("type", "rdma")
                    .string("device", format!("/dev/infiniband/{name}"))
                    .string("rdma-netns-mode", self.mode.to_string());
                // Shared mode lets any number of containers open the device.
                if self.mode == NetnsMode::Shared {
                    builder = builder.shared();
                }
                let ibdev = self.paths.resolve_ibdev(&name);
                if let Some(ibdev) = &ibdev {
                    builder = builder.string("ibdev", ibdev.as_str());
                }
                debug!(device = %name, ibdev = ?ibdev, mode = %self.mode, "discovered RDMA device");
                builder.build()
            })
            .collect()
    }

    fn virtual_pools(&self) -> Vec<Device> {
        let mut devices = vec![DeviceBuilder::new(&self.driver_name, "netdev-virtual")
            .string("type", "netdev")
            .string("kind", "virtual")
            .shared()
            .build()];

        for name in self.interfaces() {
            if name == "lo" || !self.paths.sys_class_net.join(&name).join("device").exists() {
                continue;
            }
            for kind in ["macvlan", "ipvlan"] {
                devices.push(
                    DeviceBuilder::new(&self.driver_name, format!("{name}-{kind}-pool"))
                        .string("type", "netdev")
                        .string("kind", kind)
                        .string("parent", name.as_str())
                        .build(),
                );
            }
            debug!(parent = %name, "discovered virtual pool parent");
        }
        devices
    }
}

fn vf_parent(device_dir: &Path) -> Option<String> {
    HostPaths::list_prefixed(&device_dir.join("physfn").join("net"), "")
        .ok()?
        .into_iter()
        .next()
}

fn pci_address(device_dir: &Path) -> Option<String> {
    let target = fs::read_link(device_dir).ok()?;
    Some(target.file_name()?.to_string_lossy().into_owned())
}

fn numa_node(device_dir: &Path) -> Option<i64> {
    let raw = fs::read_to_string(device_dir.join("numa_node")).ok()?;
    raw.trim().parse().ok().filter(|node| *node >= 0)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;
    use std::path::PathBuf;

    use similar_asserts::assert_eq;

    use super::*;

    const DRIVER: &str = "dra.example.com";

    struct FakeHost {
        root: tempfile::TempDir,
        paths: HostPaths,
    }

    impl FakeHost {
        fn new() -> Self {
            let root = tempfile::tempdir().expect("temp dir");
            let paths = HostPaths::with_root(root.path());
            fs::create_dir_all(&paths.sys_class_net).expect("net dir");
            Self { root, paths }
        }

        fn virtual_iface(&self, name: &str) -> PathBuf {
            let dir = self.paths.sys_class_net.join(name);
            fs::create_dir_all(&dir).expect("iface dir");
            dir
        }

        /// Interface backed by a PCI function.
        fn pci_iface(&self, name: &str, pci: &str) -> PathBuf {
            let iface = self.virtual_iface(name);
            let pci_dir = self.root.path().join("devices").join(pci);
            fs::create_dir_all(&pci_dir).expect("pci dir");
            symlink(&pci_dir, iface.join("device")).expect("device link");
            pci_dir
        }

        fn uverbs(&self, name: &str, ibdev: &str) {
            fs::create_dir_all(&self.paths.dev_infiniband).expect("dev dir");
            fs::write(self.paths.dev_infiniband.join(name), "").expect("char dev");
            let verbs = self.paths.sys_class_infiniband_verbs.join(name);
            fs::create_dir_all(&verbs).expect("verbs dir");
            fs::write(verbs.join("ibdev"), format!("{ibdev}\n")).expect("ibdev");
        }
    }

    fn attr(device: &Device, key: &str) -> Option<DeviceAttribute> {
        device.attributes.get(&format!("{DRIVER}/{key}")).cloned()
    }

    fn string(value: &str) -> Option<DeviceAttribute> {
        Some(DeviceAttribute::String(value.to_string()))
    }

    #[test]
    fn discovers_vfs_with_pci_and_numa() {
        let host = FakeHost::new();
        let pf = host.pci_iface("ens1f0", "0000:3b:00.0");
        fs::create_dir_all(pf.join("net").join("ens1f0")).expect("pf net");
        let vf = host.pci_iface("ens1f0v0", "0000:3b:00.2");
        symlink(&pf, vf.join("physfn")).expect("physfn");
        fs::write(vf.join("numa_node"), "1\n").expect("numa");

        let devices = Discovery::new(DRIVER, host.paths.clone(), NetnsMode::Shared).network_devices();

        let vf = devices.iter().find(|d| d.name == "ens1f0v0").expect("vf");
        assert_eq!(attr(vf, "kind"), string("sriov-vf"));
        assert_eq!(attr(vf, "parent"), string("ens1f0"));
        assert_eq!(attr(vf, "pci-address"), string("0000:3b:00.2"));
        assert_eq!(attr(vf, "numa-node"), Some(DeviceAttribute::Int(1)));
        // The PF itself matches the `ens` pattern.
        assert!(devices.iter().any(|d| d.name == "netdev-ens1f0"));
    }

    #[test]
    fn skips_host_interfaces() {
        let host = FakeHost::new();
        for name in ["lo", "eth0", "docker0", "cni0", "veth1234", "dummy0", "wlan0"] {
            host.virtual_iface(name);
        }

        let devices = Discovery::new(DRIVER, host.paths.clone(), NetnsMode::Shared).network_devices();

        let names: Vec<&str> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["netdev-dummy0"]);
    }

    #[test]
    fn rdma_devices_follow_netns_mode() {
        let host = FakeHost::new();
        host.uverbs("uverbs0", "mlx5_0");
        fs::write(host.paths.dev_infiniband.join("rdma_cm"), "").expect("rdma_cm");

        let shared = Discovery::new(DRIVER, host.paths.clone(), NetnsMode::Shared).rdma_devices();
        let exclusive = Discovery::new(DRIVER, host.paths.clone(), NetnsMode::Exclusive).rdma_devices();

        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].allow_multiple_allocations, Some(true));
        assert_eq!(attr(&shared[0], "ibdev"), string("mlx5_0"));
        assert_eq!(attr(&shared[0], "device"), string("/dev/infiniband/uverbs0"));
        assert_eq!(exclusive[0].allow_multiple_allocations, None);
        assert_eq!(attr(&exclusive[0], "rdma-netns-mode"), string("exclusive"));
    }

    #[test]
    fn virtual_pools_per_physical_parent() {
        let host = FakeHost::new();
        host.pci_iface("enp1s0", "0000:01:00.0");
        host.virtual_iface("dummy0");

        let devices = Discovery::new(DRIVER, host.paths.clone(), NetnsMode::Shared).virtual_pools();

        let names: Vec<&str> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["netdev-virtual", "enp1s0-macvlan-pool", "enp1s0-ipvlan-pool"]
        );
        assert_eq!(devices[0].allow_multiple_allocations, Some(true));
    }

    #[test]
    fn attributes_serialize_as_tagged_values() {
        let device = DeviceBuilder::new(DRIVER, "uverbs0")
            .string("type", "rdma")
            .int("numa-node", 0)
            .build();

        assert_eq!(
            serde_json::to_value(&device).expect("json"),
            serde_json::json!({
                "name": "uverbs0",
                "attributes": {
                    "dra.example.com/numa-node": {"int": 0},
                    "dra.example.com/type": {"string": "rdma"}
                }
            })
        );
    }
}
