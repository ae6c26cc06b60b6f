//! Per-key mutual exclusion with dynamic allocation and eviction.
//!
//! Holders of the same key are serialized; holders of different keys run
//! concurrently. Entries are allocated on first lock and evicted when the
//! last holder releases, so the registry stays proportional to the number
//! of keys currently contended.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct LockEntry {
    lock: Arc<AsyncMutex<()>>,
    holders: usize,
}

/// A registry of refcounted sub-locks, one per key.
///
/// The registry-wide mutex is held only for O(1) bookkeeping; the sub-lock
/// itself is always acquired after that mutex has been released, so waiting
/// on one key never blocks lock/unlock traffic on any other key.
#[derive(Default)]
pub struct KeyedMutex {
    entries: Mutex<HashMap<String, LockEntry>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the sub-lock for `key`, waiting behind any current holder of
    /// the same key. The lock is released when the returned guard drops.
    pub async fn lock(&self, key: &str) -> KeyedGuard<'_> {
        let sub_lock = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(key.to_string()).or_insert_with(|| LockEntry {
                lock: Arc::new(AsyncMutex::new(())),
                holders: 0,
            });
            entry.holders += 1;
            Arc::clone(&entry.lock)
        };

        // Await outside the registry critical section.
        let guard = sub_lock.lock_owned().await;
        KeyedGuard {
            registry: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Holds the sub-lock for one key. Dropping the guard decrements the holder
/// count, evicts the entry if this was the last holder, and only then
/// releases the sub-lock.
pub struct KeyedGuard<'a> {
    registry: &'a KeyedMutex,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        let mut entries = self.registry.entries.lock();
        let entry = entries
            .get_mut(&self.key)
            .unwrap_or_else(|| panic!("unlock of unknown key {:?}", self.key));
        entry.holders -= 1;
        if entry.holders == 0 {
            entries.remove(&self.key);
        }
        drop(entries);

        // Eviction has already happened: a racing lock() for this key either
        // queued behind us (holders > 0, entry kept) or allocates fresh.
        self.guard.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let registry = Arc::new(KeyedMutex::new());
        let in_section = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let in_section = Arc::clone(&in_section);
            let max_seen = Arc::clone(&max_seen);
            tasks.push(tokio::spawn(async move {
                let _guard = registry.lock("svc").await;
                let now = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_section.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(registry.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_overlap() {
        let registry = Arc::new(KeyedMutex::new());
        let guard_a = registry.lock("a").await;

        // A second key must not queue behind the first.
        let registry2 = Arc::clone(&registry);
        let other = tokio::time::timeout(Duration::from_secs(1), async move {
            let _guard_b = registry2.lock("b").await;
        })
        .await;
        assert!(other.is_ok(), "lock on a different key blocked");

        drop(guard_a);
        assert_eq!(registry.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_waiter_reuses_live_entry() {
        let registry = Arc::new(KeyedMutex::new());
        let guard = registry.lock("svc").await;

        let registry2 = Arc::clone(&registry);
        let waiter = tokio::spawn(async move {
            let _guard = registry2.lock("svc").await;
        });

        // Give the waiter time to register before the holder releases.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.entry_count(), 1);

        drop(guard);
        waiter.await.unwrap();
        assert_eq!(registry.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_balanced_lock_unlock_leaves_empty_map() {
        let registry = KeyedMutex::new();
        for _ in 0..3 {
            let guard = registry.lock("k").await;
            drop(guard);
        }
        assert_eq!(registry.entry_count(), 0);
    }
}
