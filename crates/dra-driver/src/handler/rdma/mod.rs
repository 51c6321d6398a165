//! RDMA device handlers.

pub mod mode;
mod uverbs;

pub use uverbs::UverbsHandler;
