// ABOUTME: Keyed async locks serializing outgoing sends per identity space
// ABOUTME: Also used per target event for reaction-list reconciliation

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A map of async mutexes, one per key, handed out as owned guards.
///
/// Every code path that sends, edits, or deletes on behalf of one remote
/// actor must hold the lock for that actor's space across both the remote
/// call and the following mapping-record write, so two concurrent sends
/// cannot interleave their remote IDs with their local inserts.
pub struct KeyedLocks<K> {
    inner: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the lock for `key`, waiting behind any current holder.
    pub async fn acquire(&self, key: K) -> OwnedMutexGuard<()> {
        let entry = {
            let mut map = self.inner.lock().await;
            // Opportunistically drop idle entries so the map stays bounded
            // by the number of simultaneously active keys.
            map.retain(|_, m| Arc::strong_count(m) > 1);
            Arc::clone(map.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))))
        };
        entry.lock_owned().await
    }

    /// Acquire when an actor is known; callers with no actor (system-side
    /// backfill bookkeeping) proceed unguarded and must guarantee
    /// non-overlap themselves.
    pub async fn acquire_opt(&self, key: Option<K>) -> Option<OwnedMutexGuard<()>> {
        match key {
            Some(k) => Some(self.acquire(k).await),
            None => None,
        }
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}
