use std::path::PathBuf;

use clap::Parser;

use crate::driver::store::DEFAULT_CDI_DIR;

pub const DEFAULT_DRIVER_NAME: &str = "dra.example.com";

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "DRIVER_NAME",
        default_value = DEFAULT_DRIVER_NAME,
        help = "Name of the DRA driver"
    )]
    pub driver_name: String,

    #[arg(
        long,
        env = "NODE_NAME",
        help = "Name of the node (from downward API)"
    )]
    pub node_name: String,

    #[arg(
        long,
        env = "POD_UID",
        help = "UID of this driver pod (from downward API), enables rolling updates"
    )]
    pub pod_uid: Option<String>,

    #[arg(
        long,
        default_value = DEFAULT_CDI_DIR,
        value_hint = clap::ValueHint::DirPath,
        help = "Directory for CDI specs and allocation state"
    )]
    pub cdi_dir: PathBuf,

    #[arg(
        long,
        default_value = "/var/lib/kubelet/plugins",
        value_hint = clap::ValueHint::DirPath,
        help = "Kubelet plugins directory; the DRA socket lives in <plugins-dir>/<driver-name>"
    )]
    pub plugins_dir: PathBuf,

    #[arg(
        long,
        default_value = "/var/lib/kubelet/plugins_registry",
        value_hint = clap::ValueHint::DirPath,
        help = "Kubelet plugin registration directory"
    )]
    pub registry_dir: PathBuf,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        help = "Publish discovered devices as a ResourceSlice",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub publish_resources: bool,

    #[arg(
        long,
        env = "SANDBOX_SOCKET",
        value_hint = clap::ValueHint::FilePath,
        help = "Unix socket receiving pod sandbox events; defaults to <plugins-dir>/<driver-name>/sandbox.sock"
    )]
    pub sandbox_socket: Option<PathBuf>,
}

impl DaemonArgs {
    /// Directory holding the driver's own sockets.
    pub fn plugin_dir(&self) -> PathBuf {
        self.plugins_dir.join(&self.driver_name)
    }

    pub fn sandbox_socket_path(&self) -> PathBuf {
        self.sandbox_socket
            .clone()
            .unwrap_or_else(|| self.plugin_dir().join("sandbox.sock"))
    }
}
