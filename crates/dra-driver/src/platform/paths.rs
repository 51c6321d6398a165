use std::path::Path;
use std::path::PathBuf;

/// Host filesystem locations read by handlers and discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    /// `/dev/infiniband`
    pub dev_infiniband: PathBuf,
    /// `/sys/class/net`
    pub sys_class_net: PathBuf,
    /// `/sys/class/infiniband`
    pub sys_class_infiniband: PathBuf,
    /// `/sys/class/infiniband_verbs`
    pub sys_class_infiniband_verbs: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self::with_root("/")
    }
}

impl HostPaths {
    /// All locations relative to `root` instead of `/`.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            dev_infiniband: root.join("dev/infiniband"),
            sys_class_net: root.join("sys/class/net"),
            sys_class_infiniband: root.join("sys/class/infiniband"),
            sys_class_infiniband_verbs: root.join("sys/class/infiniband_verbs"),
        }
    }

    /// Kernel IB device name behind a uverbs char device, e.g. `uverbs0` -> `mlx5_0`.
    pub fn resolve_ibdev(&self, uverbs: &str) -> Option<String> {
        let path = self.sys_class_infiniband_verbs.join(uverbs).join("ibdev");
        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let ibdev = raw.trim();
                (!ibdev.is_empty()).then(|| ibdev.to_string())
            }
            Err(e) => {
                tracing::debug!(uverbs, error = %e, "could not resolve IB device");
                None
            }
        }
    }

    /// Sorted entry names of `dir` that start with `prefix`.
    pub fn list_prefixed(dir: &Path, prefix: &str) -> std::io::Result<Vec<String>> {
        let mut names: Vec<String> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with(prefix))
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn default_paths_are_absolute() {
        let paths = HostPaths::default();

        assert_eq!(paths.dev_infiniband, PathBuf::from("/dev/infiniband"));
        assert_eq!(paths.sys_class_net, PathBuf::from("/sys/class/net"));
    }

    #[test]
    fn resolve_ibdev_trims_sysfs_value() {
        let root = tempfile::tempdir().expect("temp dir");
        let paths = HostPaths::with_root(root.path());
        let dir = paths.sys_class_infiniband_verbs.join("uverbs0");
        std::fs::create_dir_all(&dir).expect("create sysfs dir");
        std::fs::write(dir.join("ibdev"), "mlx5_0\n").expect("write ibdev");

        assert_eq!(paths.resolve_ibdev("uverbs0").as_deref(), Some("mlx5_0"));
        assert_eq!(paths.resolve_ibdev("uverbs1"), None);
    }

    #[test]
    fn list_prefixed_filters_and_sorts() {
        let dir = tempfile::tempdir().expect("temp dir");
        for name in ["uverbs1", "rdma_cm", "uverbs0", "umad0"] {
            std::fs::write(dir.path().join(name), "").expect("write");
        }

        let names = HostPaths::list_prefixed(dir.path(), "uverbs").expect("list");

        assert_eq!(names, vec!["uverbs0".to_string(), "uverbs1".to_string()]);
    }
}
