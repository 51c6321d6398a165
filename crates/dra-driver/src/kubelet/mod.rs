//! Kubelet-facing boundary.
//!
//! The kubelet discovers the driver through its plugin registration socket
//! and then calls the DRA node service on a second socket. Claim objects are
//! read from the API server before they are handed to the [`Driver`].
//!
//! [`Driver`]: crate::driver::Driver

pub mod claim_locks;
pub mod claims;
pub mod plugin;
pub mod registration;
pub mod resource_api;

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use thiserror::Error;
use tokio::net::UnixListener;
use tracing::debug;
use tracing::warn;

pub use claims::ClaimSource;
pub use claims::KubeClaimSource;
pub use plugin::DraPluginService;
pub use registration::RegistrationService;
pub use resource_api::ResourceApi;

// Include generated protobuf code
pub mod dra {
    tonic::include_proto!("k8s.io.kubelet.pkg.apis.dra.v1beta1");
}

pub mod pluginregistration {
    tonic::include_proto!("pluginregistration");
}

/// Version string the kubelet matches against its DRA client.
pub const DRA_SERVICE_VERSION: &str = "v1beta1.DRAPlugin";

/// Plugin type reported during registration.
pub const DRA_PLUGIN_TYPE: &str = "DRAPlugin";

/// Errors that can occur at the kubelet and API server boundary.
#[derive(Debug, Error)]
pub enum KubeletError {
    #[error("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[error("Failed to load kubeconfig {path}")]
    Kubeconfig { path: String },
    #[error("Failed to fetch ResourceClaim {namespace}/{name}")]
    ClaimFetch { namespace: String, name: String },
    #[error("Failed to decode {kind} object")]
    Decode { kind: String },
    #[error("Socket setup failed: {path}")]
    Socket { path: String },
    #[error("gRPC server on {path} failed")]
    Serve { path: String },
    #[error("Failed to publish ResourceSlice {name}")]
    Publish { name: String },
}

/// Socket paths of one driver instance.
///
/// With a pod UID set, both names carry it so that two instances of the
/// driver can run side by side during a rolling update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketPaths {
    pub plugin: PathBuf,
    pub registration: PathBuf,
}

impl SocketPaths {
    pub fn new(
        plugins_dir: &Path,
        registry_dir: &Path,
        driver_name: &str,
        pod_uid: Option<&str>,
    ) -> Self {
        let (plugin, registration) = match pod_uid.filter(|uid| !uid.is_empty()) {
            Some(uid) => (format!("dra-{uid}.sock"), format!("{driver_name}-{uid}-reg.sock")),
            None => ("dra.sock".to_string(), format!("{driver_name}-reg.sock")),
        };
        Self {
            plugin: plugins_dir.join(driver_name).join(plugin),
            registration: registry_dir.join(registration),
        }
    }
}

/// Binds a Unix listener, creating the parent directory and replacing a
/// stale socket file.
pub(crate) fn bind_socket(path: &Path) -> Result<UnixListener, Report<KubeletError>> {
    let context = || KubeletError::Socket {
        path: path.display().to_string(),
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).change_context_lazy(context)?;
    }
    if path.exists() {
        debug!(path = %path.display(), "removing stale socket");
        fs::remove_file(path).change_context_lazy(context)?;
    }
    UnixListener::bind(path).change_context_lazy(context)
}

pub(crate) fn remove_socket(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove socket");
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn socket_paths_without_pod_uid() {
        let paths = SocketPaths::new(
            Path::new("/var/lib/kubelet/plugins"),
            Path::new("/var/lib/kubelet/plugins_registry"),
            "dra.example.com",
            None,
        );

        assert_eq!(
            paths.plugin,
            PathBuf::from("/var/lib/kubelet/plugins/dra.example.com/dra.sock")
        );
        assert_eq!(
            paths.registration,
            PathBuf::from("/var/lib/kubelet/plugins_registry/dra.example.com-reg.sock")
        );
        assert_eq!(
            paths,
            SocketPaths::new(
                Path::new("/var/lib/kubelet/plugins"),
                Path::new("/var/lib/kubelet/plugins_registry"),
                "dra.example.com",
                Some(""),
            )
        );
    }

    #[test]
    fn socket_paths_with_pod_uid() {
        let paths = SocketPaths::new(Path::new("/p"), Path::new("/r"), "dra.example.com", Some("abc"));

        assert_eq!(paths.plugin, PathBuf::from("/p/dra.example.com/dra-abc.sock"));
        assert_eq!(paths.registration, PathBuf::from("/r/dra.example.com-abc-reg.sock"));
    }

    #[tokio::test]
    async fn bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("dra.sock");

        let first = bind_socket(&path).expect("first bind");
        drop(first);
        let _second = bind_socket(&path).expect("rebind over stale file");

        remove_socket(&path);
        assert!(!path.exists());
        remove_socket(&path);
    }
}
