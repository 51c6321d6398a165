//! Hand-off of RDMA devices between claim preparation and pod sandbox events.
//!
//! In exclusive netns mode a device must be moved into the pod's network
//! namespace, which does not exist yet when the claim is prepared. Prepare
//! records a pending move; the sandbox-created event drains it and records
//! the device as active until release or sandbox stop hands it back.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use tracing::debug;

/// Device waiting for its pod's network namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMove {
    pub claim_uid: String,
    pub ib_dev: String,
}

/// Device currently living in a pod's network namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveMove {
    pub claim_uid: String,
    pub ib_dev: String,
    pub pod_uid: String,
    pub netns_path: String,
}

#[derive(Default)]
struct TrackerState {
    pending: HashMap<String, PendingMove>,
    active: HashMap<String, ActiveMove>,
}

/// Pending and active relocations keyed by claim UID.
///
/// A claim is never pending and active at the same time. The lock only
/// covers the map updates; callers move devices after it is released.
#[derive(Default)]
pub struct RelocationTracker {
    state: Mutex<TrackerState>,
}

impl RelocationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pending(&self, claim_uid: &str, ib_dev: &str) {
        let mut state = self.state.lock();
        state.active.remove(claim_uid);
        state.pending.insert(
            claim_uid.to_string(),
            PendingMove {
                claim_uid: claim_uid.to_string(),
                ib_dev: ib_dev.to_string(),
            },
        );
        debug!(claim_uid, ib_dev, "pending RDMA move registered");
    }

    pub fn remove_pending(&self, claim_uid: &str) -> Option<PendingMove> {
        self.state.lock().pending.remove(claim_uid)
    }

    /// Removes and returns the pending moves of `claim_uids`, in that order.
    pub fn consume_pending_for_claims(&self, claim_uids: &[String]) -> Vec<PendingMove> {
        let mut state = self.state.lock();
        claim_uids
            .iter()
            .filter_map(|uid| state.pending.remove(uid))
            .collect()
    }

    pub fn mark_active(&self, claim_uid: &str, pod_uid: &str, ib_dev: &str, netns_path: &str) {
        let mut state = self.state.lock();
        state.pending.remove(claim_uid);
        state.active.insert(
            claim_uid.to_string(),
            ActiveMove {
                claim_uid: claim_uid.to_string(),
                ib_dev: ib_dev.to_string(),
                pod_uid: pod_uid.to_string(),
                netns_path: netns_path.to_string(),
            },
        );
    }

    /// Active moves of `pod_uid`, sorted by claim UID.
    pub fn get_active_for_pod(&self, pod_uid: &str) -> Vec<ActiveMove> {
        let state = self.state.lock();
        let mut moves: Vec<ActiveMove> = state
            .active
            .values()
            .filter(|m| m.pod_uid == pod_uid)
            .cloned()
            .collect();
        moves.sort_by(|a, b| a.claim_uid.cmp(&b.claim_uid));
        moves
    }

    pub fn remove_active(&self, claim_uid: &str) -> Option<ActiveMove> {
        self.state.lock().active.remove(claim_uid)
    }

    /// Removes and returns the active moves of `pod_uid`, sorted by claim UID.
    pub fn remove_active_for_pod(&self, pod_uid: &str) -> Vec<ActiveMove> {
        let mut state = self.state.lock();
        let claims: Vec<String> = state
            .active
            .values()
            .filter(|m| m.pod_uid == pod_uid)
            .map(|m| m.claim_uid.clone())
            .collect();
        let mut moves: Vec<ActiveMove> = claims
            .iter()
            .filter_map(|uid| state.active.remove(uid))
            .collect();
        moves.sort_by(|a, b| a.claim_uid.cmp(&b.claim_uid));
        moves
    }

    /// `(pending, active)` counts.
    pub fn counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.pending.len(), state.active.len())
    }
}

impl fmt::Display for RelocationTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (pending, active) = self.counts();
        write!(f, "RelocationTracker{{pending={pending}, active={active}}}")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use similar_asserts::assert_eq;

    use super::*;

    fn claims(uids: &[&str]) -> Vec<String> {
        uids.iter().map(|u| u.to_string()).collect()
    }

    #[test]
    fn consume_drains_pending_once() {
        let tracker = RelocationTracker::new();
        tracker.add_pending("c", "mlx5_0");

        let first = tracker.consume_pending_for_claims(&claims(&["c"]));
        let second = tracker.consume_pending_for_claims(&claims(&["c"]));

        assert_eq!(
            first,
            vec![PendingMove {
                claim_uid: "c".to_string(),
                ib_dev: "mlx5_0".to_string(),
            }]
        );
        assert!(second.is_empty());
        assert_eq!(tracker.counts(), (0, 0));
    }

    #[test]
    fn remove_active_for_pod_drains_once() {
        let tracker = RelocationTracker::new();
        tracker.mark_active("c", "p", "mlx5_0", "/proc/42/ns/net");
        tracker.mark_active("other", "q", "mlx5_1", "/proc/43/ns/net");

        let first = tracker.remove_active_for_pod("p");
        let second = tracker.remove_active_for_pod("p");

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].ib_dev, "mlx5_0");
        assert_eq!(first[0].netns_path, "/proc/42/ns/net");
        assert!(second.is_empty());
        assert_eq!(tracker.get_active_for_pod("q").len(), 1);
    }

    #[test]
    fn counts_follow_claim_lifecycle() {
        let tracker = RelocationTracker::new();

        tracker.add_pending("claim-1", "mlx5_0");
        assert_eq!(tracker.counts(), (1, 0));
        assert_eq!(tracker.to_string(), "RelocationTracker{pending=1, active=0}");

        tracker.mark_active("claim-1", "pod-1", "mlx5_0", "/proc/123/ns/net");
        assert_eq!(tracker.counts(), (0, 1));

        let removed = tracker.remove_active("claim-1").expect("active move");
        assert_eq!(removed.pod_uid, "pod-1");
        assert_eq!(tracker.counts(), (0, 0));
    }

    #[test]
    fn pending_and_active_are_exclusive() {
        let tracker = RelocationTracker::new();
        tracker.mark_active("c", "p", "mlx5_0", "/proc/1/ns/net");

        tracker.add_pending("c", "mlx5_0");

        assert_eq!(tracker.counts(), (1, 0));
        assert!(tracker.remove_active("c").is_none());
    }

    #[test]
    fn consume_keeps_requested_order_and_ignores_unknown() {
        let tracker = RelocationTracker::new();
        tracker.add_pending("a", "mlx5_0");
        tracker.add_pending("b", "mlx5_1");

        let moves = tracker.consume_pending_for_claims(&claims(&["b", "zzz", "a"]));

        let devs: Vec<&str> = moves.iter().map(|m| m.ib_dev.as_str()).collect();
        assert_eq!(devs, vec!["mlx5_1", "mlx5_0"]);
    }

    #[test]
    fn concurrent_updates_keep_counts_consistent() {
        let tracker = Arc::new(RelocationTracker::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    let claim = format!("claim-{i}");
                    tracker.add_pending(&claim, "mlx5_0");
                    tracker.mark_active(&claim, "pod", "mlx5_0", "/proc/1/ns/net");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }

        assert_eq!(tracker.counts(), (0, 8));
        assert_eq!(tracker.remove_active_for_pod("pod").len(), 8);
    }
}
