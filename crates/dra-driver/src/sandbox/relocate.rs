use std::fs::File;
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::platform::netns;
use crate::platform::netns::NetnsGuard;
use crate::platform::PlatformError;
use crate::platform::RdmaOps;

/// Moves RDMA devices between the host and pod network namespaces.
pub struct Relocator {
    rdma: Arc<dyn RdmaOps>,
    host_netns: PathBuf,
}

impl Relocator {
    pub fn new(rdma: Arc<dyn RdmaOps>) -> Self {
        Self {
            rdma,
            host_netns: PathBuf::from(netns::HOST_NETNS_PATH),
        }
    }

    /// Overrides the namespace devices are returned to.
    pub fn with_host_netns(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_netns = path.into();
        self
    }

    pub fn rdma(&self) -> &Arc<dyn RdmaOps> {
        &self.rdma
    }

    /// Moves `ib_dev`, visible from the calling thread, into `target`.
    pub fn move_into(&self, ib_dev: &str, target: &File) -> Result<(), PlatformError> {
        let index = self
            .rdma
            .find_device(ib_dev)?
            .ok_or_else(|| PlatformError::NotFound {
                kind: "rdma device",
                name: ib_dev.to_string(),
            })?;
        self.rdma.set_netns(index, target.as_fd())
    }

    /// Moves `ib_dev` from the pod namespace back to the host namespace.
    ///
    /// Runs on its own thread because looking the device up requires entering
    /// `pod_netns`. A device that cannot be found was reclaimed by namespace
    /// teardown already. Failures are logged and never returned.
    pub async fn return_to_host(&self, ib_dev: &str, pod_netns: Option<&str>) {
        let rdma = self.rdma.clone();
        let host_netns = self.host_netns.clone();
        let ib_dev = ib_dev.to_string();
        let pod_netns = pod_netns.filter(|p| !p.is_empty()).map(str::to_string);

        let outcome = netns::run_on_thread("rdma-return", move || {
            return_on_current_thread(rdma.as_ref(), &host_netns, &ib_dev, pod_netns.as_deref())
        })
        .await;

        if let Err(e) = outcome {
            warn!(error = %e, "RDMA return-to-host thread failed");
        }
    }
}

fn return_on_current_thread(
    rdma: &dyn RdmaOps,
    host_netns: &std::path::Path,
    ib_dev: &str,
    pod_netns: Option<&str>,
) {
    let host = match netns::open(host_netns) {
        Ok(file) => file,
        Err(e) => {
            warn!(ib_dev, error = %e, "cannot open host network namespace");
            return;
        }
    };

    // Restores the thread's namespace when dropped, on every return below.
    let _guard = pod_netns.and_then(|path| {
        match netns::open(path).and_then(|pod| NetnsGuard::enter(&pod)) {
            Ok(guard) => Some(guard),
            Err(e) => {
                debug!(ib_dev, netns = path, error = %e, "pod namespace unavailable, searching current namespace");
                None
            }
        }
    });

    let index = match rdma.find_device(ib_dev) {
        Ok(Some(index)) => index,
        Ok(None) => {
            debug!(ib_dev, "RDMA device not found, assuming it was reclaimed");
            return;
        }
        Err(e) => {
            warn!(ib_dev, error = %e, "RDMA device lookup failed");
            return;
        }
    };

    match rdma.set_netns(index, host.as_fd()) {
        Ok(()) => info!(ib_dev, "returned RDMA device to host namespace"),
        Err(e) => debug!(ib_dev, error = %e, "RDMA device not moved to host namespace, may already be there"),
    }
}
