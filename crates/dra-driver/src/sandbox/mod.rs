//! Pod sandbox lifecycle handling for RDMA devices in exclusive netns mode.

pub mod annotations;
pub mod api;
mod coordinator;
mod relocate;
pub mod tracker;

pub use coordinator::SandboxCoordinator;
pub use relocate::Relocator;
pub use tracker::ActiveMove;
pub use tracker::PendingMove;
pub use tracker::RelocationTracker;
