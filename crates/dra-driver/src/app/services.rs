use std::sync::Arc;

use crate::discovery::Device;
use crate::discovery::SlicePublisher;
use crate::driver::Driver;
use crate::kubelet::ClaimSource;
use crate::kubelet::SocketPaths;
use crate::sandbox::RelocationTracker;
use crate::sandbox::SandboxCoordinator;

/// Application dependencies - simple struct with Arc-wrapped services
pub struct ApplicationServices {
    pub driver: Arc<Driver>,
    pub claims: Arc<dyn ClaimSource>,
    pub sockets: SocketPaths,
    pub tracker: Arc<RelocationTracker>,
    /// Present only when RDMA devices have to follow pod namespaces.
    pub sandbox_coordinator: Option<Arc<SandboxCoordinator>>,
    pub publisher: Option<Arc<SlicePublisher>>,
    pub devices: Vec<Device>,
}
