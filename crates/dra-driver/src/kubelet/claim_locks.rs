//! Per-claim serialization of kubelet calls.
//!
//! Prepare and release of the same claim never overlap; different claims
//! proceed in parallel. Lock entries are held weakly and dropped with the
//! last guard.

use std::sync::Arc;
use std::sync::Weak;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::sync::OwnedMutexGuard;

type LockMap = DashMap<String, Weak<Mutex<()>>>;

/// Held while one claim is being prepared or released.
pub struct ClaimGuard {
    guard: Option<OwnedMutexGuard<()>>,
    claim_uid: String,
    locks: Arc<LockMap>,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Checked under the shard lock; a waiter still holds a strong reference.
        self.locks
            .remove_if(&self.claim_uid, |_, weak| weak.strong_count() == 0);
    }
}

#[derive(Default)]
pub struct ClaimLocks {
    locks: Arc<LockMap>,
}

impl ClaimLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, claim_uid: &str) -> ClaimGuard {
        let lock = self.lock_for(claim_uid);
        let guard = lock.lock_owned().await;
        ClaimGuard {
            guard: Some(guard),
            claim_uid: claim_uid.to_string(),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Locks every claim of a batch. UIDs are taken in sorted order so two
    /// overlapping batches cannot deadlock.
    pub async fn lock_all<'a>(&self, claim_uids: impl IntoIterator<Item = &'a str>) -> Vec<ClaimGuard> {
        let mut uids: Vec<&str> = claim_uids.into_iter().collect();
        uids.sort_unstable();
        uids.dedup();

        let mut guards = Vec::with_capacity(uids.len());
        for uid in uids {
            guards.push(self.lock(uid).await);
        }
        guards
    }

    fn lock_for(&self, claim_uid: &str) -> Arc<Mutex<()>> {
        match self.locks.entry(claim_uid.to_string()) {
            Entry::Occupied(mut occupied) => {
                if let Some(lock) = occupied.get().upgrade() {
                    return lock;
                }
                let lock = Arc::new(Mutex::new(()));
                occupied.insert(Arc::downgrade(&lock));
                lock
            }
            Entry::Vacant(vacant) => {
                let lock = Arc::new(Mutex::new(()));
                vacant.insert(Arc::downgrade(&lock));
                lock
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.len()
    }
}
