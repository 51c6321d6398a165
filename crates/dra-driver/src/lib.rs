//! Node-local Kubernetes DRA driver for network interfaces, RDMA verbs
//! devices and RoCE combinations of the two.

pub mod app;
pub mod config;
pub mod discovery;
pub mod driver;
pub mod error;
pub mod handler;
pub mod kubelet;
pub mod platform;
pub mod sandbox;
