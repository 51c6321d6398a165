use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use api_types::DeviceType;
use tracing::debug;

use super::DeviceHandler;
use crate::error::DriverError;
use crate::error::Result;

/// Handlers keyed by device type, then kind.
///
/// Built once at startup and shared read-only afterwards.
#[derive(Default)]
pub struct Registry {
    handlers: HashMap<DeviceType, HashMap<String, Arc<dyn DeviceHandler>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for every kind it declares, replacing earlier entries.
    pub fn register(&mut self, handler: Arc<dyn DeviceHandler>) {
        let device_type = handler.device_type();
        let kinds = self.handlers.entry(device_type).or_default();
        for kind in handler.kinds() {
            if kinds.insert(kind.to_string(), handler.clone()).is_some() {
                debug!(%device_type, kind, "replacing registered handler");
            }
        }
    }

    pub fn get(&self, device_type: DeviceType, kind: &str) -> Option<Arc<dyn DeviceHandler>> {
        self.handlers
            .get(&device_type)
            .and_then(|kinds| kinds.get(kind))
            .cloned()
    }

    pub fn must_get(&self, device_type: DeviceType, kind: &str) -> Result<Arc<dyn DeviceHandler>> {
        self.get(device_type, kind)
            .ok_or_else(|| DriverError::NotFound {
                device_type,
                kind: kind.to_string(),
            })
    }

    /// Registered kinds per type, sorted.
    pub fn list_registered(&self) -> BTreeMap<DeviceType, Vec<String>> {
        self.handlers
            .iter()
            .map(|(device_type, kinds)| {
                let mut kinds: Vec<String> = kinds.keys().cloned().collect();
                kinds.sort();
                (*device_type, kinds)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::handler::testing::FakeHandler;

    #[test]
    fn last_registration_wins() {
        let first = FakeHandler::new(DeviceType::Netdev, "dummy", "first").arc();
        let second = FakeHandler::new(DeviceType::Netdev, "dummy", "second").arc();
        let rdma = FakeHandler::new(DeviceType::Rdma, "uverbs", "uverbs0").arc();

        let mut registry = Registry::new();
        registry.register(first.clone());
        registry.register(rdma.clone());
        registry.register(second.clone());

        let found = registry
            .get(DeviceType::Netdev, "dummy")
            .expect("dummy registered");
        let expected: Arc<dyn DeviceHandler> = second;
        assert!(Arc::ptr_eq(&found, &expected));

        let found = registry
            .must_get(DeviceType::Rdma, "uverbs")
            .expect("uverbs registered");
        let expected: Arc<dyn DeviceHandler> = rdma;
        assert!(Arc::ptr_eq(&found, &expected));
    }

    #[test]
    fn unregistered_pair_is_not_found() {
        let mut registry = Registry::new();
        registry.register(FakeHandler::new(DeviceType::Netdev, "dummy", "dm0").arc());

        assert!(registry.get(DeviceType::Netdev, "veth").is_none());
        // Same kind under another type is a different pair.
        assert!(registry.get(DeviceType::Rdma, "dummy").is_none());

        let err = registry
            .must_get(DeviceType::Combo, "roce")
            .err()
            .expect("combo not registered");
        assert!(matches!(err, DriverError::NotFound { .. }));
        assert_eq!(
            err.to_string(),
            "no handler registered for type=combo kind=roce"
        );
    }

    #[test]
    fn list_registered_sorts_kinds() {
        let mut multi = FakeHandler::new(DeviceType::Netdev, "veth", "x");
        multi.kinds = vec!["veth", "dummy", "macvlan"];

        let mut registry = Registry::new();
        registry.register(multi.arc());
        registry.register(FakeHandler::new(DeviceType::Rdma, "uverbs", "uverbs0").arc());

        let listed = registry.list_registered();

        assert_eq!(
            listed.get(&DeviceType::Netdev).cloned(),
            Some(vec![
                "dummy".to_string(),
                "macvlan".to_string(),
                "veth".to_string()
            ])
        );
        assert_eq!(
            listed.get(&DeviceType::Rdma).cloned(),
            Some(vec!["uverbs".to_string()])
        );
    }
}
