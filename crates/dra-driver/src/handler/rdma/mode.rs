//! Process-wide RDMA netns mode.
//!
//! The mode is a kernel-wide setting that only changes with a module reload,
//! so it is queried once and cached for the lifetime of the process.

use parking_lot::Mutex;
use tracing::info;
use tracing::warn;

use crate::platform::NetnsMode;
use crate::platform::RdmaNetlink;
use crate::platform::RdmaOps;

static NETNS_MODE: Mutex<Option<NetnsMode>> = parking_lot::const_mutex(None);

/// Mode of the running kernel, detected on first use.
pub fn netns_mode() -> NetnsMode {
    detect_with(&RdmaNetlink)
}

/// Like [`netns_mode`] but querying `rdma` when nothing is cached yet.
///
/// A failed query caches [`NetnsMode::Shared`], the mode that needs no
/// relocation.
pub fn detect_with(rdma: &dyn RdmaOps) -> NetnsMode {
    let mut cached = NETNS_MODE.lock();
    if let Some(mode) = *cached {
        return mode;
    }

    let mode = match rdma.netns_mode() {
        Ok(mode) => {
            info!(%mode, "detected RDMA netns mode");
            mode
        }
        Err(e) => {
            warn!(error = %e, "failed to detect RDMA netns mode, assuming shared");
            NetnsMode::Shared
        }
    };
    *cached = Some(mode);
    mode
}

/// Forgets the cached mode.
#[cfg(test)]
pub fn reset() {
    *NETNS_MODE.lock() = None;
}

/// Replaces the cached mode without querying the kernel.
#[cfg(test)]
pub fn set(mode: NetnsMode) {
    *NETNS_MODE.lock() = Some(mode);
}
