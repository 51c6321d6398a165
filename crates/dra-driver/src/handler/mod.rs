//! Device handler contract
//!
//! A handler owns one device type and one or more kinds of that type. The
//! orchestrator picks a handler by `(type, kind)` and never looks inside the
//! allocation it produces: everything needed to reverse a prepare travels in
//! [`AllocationInfo::metadata`].

pub mod combo;
pub mod netdev;
pub mod rdma;
pub mod registry;

use api_types::cdi::ContainerEdits;
use api_types::AllocationInfo;
use api_types::DeviceConfig;
use api_types::DeviceType;

use crate::error::Result;

pub use registry::Registry;

/// Pool reported for node-local devices.
pub const DEFAULT_POOL: &str = "default";

/// Input to [`DeviceHandler::prepare`].
#[derive(Debug, Clone, PartialEq)]
pub struct PrepareRequest {
    pub claim_uid: String,
    pub namespace: String,
    pub claim_name: String,
    /// Device chosen by the scheduler, if any.
    pub allocated_device: Option<String>,
    pub config: DeviceConfig,
}

impl PrepareRequest {
    /// First eight characters of the claim UID, used in created link names.
    pub fn short_uid(&self) -> &str {
        short_uid(&self.claim_uid)
    }
}

/// Output of a successful [`DeviceHandler::prepare`].
#[derive(Debug, Clone, PartialEq)]
pub struct PrepareResult {
    pub pool_name: String,
    pub device_name: String,
    pub edits: ContainerEdits,
    pub allocation: AllocationInfo,
}

/// Input to [`DeviceHandler::unprepare`].
#[derive(Debug, Clone, PartialEq)]
pub struct UnprepareRequest {
    pub claim_uid: String,
    pub allocation: AllocationInfo,
}

/// One implementation strategy for a device type.
#[async_trait::async_trait]
pub trait DeviceHandler: Send + Sync {
    fn device_type(&self) -> DeviceType;

    /// Kinds served by this handler, registered under [`Self::device_type`].
    fn kinds(&self) -> Vec<&'static str>;

    /// Rejects configurations this handler cannot serve, before any side effect.
    fn validate(&self, config: &DeviceConfig) -> Result<()>;

    /// Creates or claims the device and describes how to expose it.
    ///
    /// Anything created here is removed again before an error is returned.
    async fn prepare(&self, request: &PrepareRequest) -> Result<PrepareResult>;

    /// Reverses [`Self::prepare`]. A resource that is already gone is success.
    async fn unprepare(&self, request: &UnprepareRequest) -> Result<()>;
}

/// First eight characters of a claim UID, or the whole UID when shorter.
pub fn short_uid(uid: &str) -> &str {
    match uid.char_indices().nth(8) {
        Some((end, _)) => &uid[..end],
        None => uid,
    }
}


#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn short_uid_takes_eight_characters() {
        assert_eq!(short_uid("12345678-aaaa-bbbb"), "12345678");
        assert_eq!(short_uid("1234"), "1234");
        assert_eq!(short_uid(""), "");
    }
}
