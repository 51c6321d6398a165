//! Host capabilities used by the device handlers.
//!
//! Everything that touches the kernel lives behind the traits in this module
//! so the orchestration logic can be exercised without root privileges.

pub mod link;
#[cfg(test)]
pub mod mock;
pub mod netns;
pub mod paths;
pub mod rdma;

use thiserror::Error;

pub use link::LinkOps;
pub use link::NewLink;
pub use link::RtnetlinkLinks;
pub use paths::HostPaths;
pub use rdma::NetnsMode;
pub use rdma::RdmaNetlink;
pub use rdma::RdmaOps;

/// Errors raised by host capabilities
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("netlink {operation} failed: {message}")]
    Netlink { operation: String, message: String },

    #[error("namespace operation failed: {message}")]
    Namespace { message: String },

    #[error("command `{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PlatformError {
    pub fn netlink(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Netlink {
            operation: operation.into(),
            message: message.to_string(),
        }
    }
}
