//! Sharded per-key async locks.
//!
//! The in-memory store serializes ledger decisions per (subscription,
//! document) pair. Unrelated keys never contend on the same async mutex; the
//! short synchronous shard lock only guards the map lookup.

use std::{
    collections::HashMap,
    hash::{BuildHasher, Hash, RandomState},
    sync::{Arc, Mutex},
};

use tokio::sync::OwnedMutexGuard;

const SHARDS: usize = 16;

type Shard<K> = Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>;

/// Map of async mutexes keyed by `K`, split over a fixed set of shards.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    shards: Arc<Vec<Shard<K>>>,
    hasher: RandomState,
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    /// Creates an empty lock map.
    pub fn new() -> Self {
        Self {
            shards: Arc::new((0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect()),
            hasher: RandomState::new(),
        }
    }

    fn shard(&self, key: &K) -> usize {
        (self.hasher.hash_one(key) as usize) % SHARDS
    }

    /// Waits for exclusive access to `key`.
    ///
    /// The entry is dropped again once the last holder or waiter releases
    /// its guard.
    pub async fn lock(&self, key: K) -> KeyGuard<K> {
        let index = self.shard(&key);
        let mutex = {
            let mut shard = self.shards[index].lock().unwrap_or_else(|e| e.into_inner());
            shard.entry(key.clone()).or_default().clone()
        };

        let guard = mutex.lock_owned().await;
        KeyGuard { guard: Some(guard), key: Some(key), index, shards: self.shards.clone() }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap_or_else(|e| e.into_inner()).len()).sum()
    }

    /// Returns true when no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive access to one key; releases on drop.
#[derive(Debug)]
pub struct KeyGuard<K>
where
    K: Eq + Hash,
{
    guard: Option<OwnedMutexGuard<()>>,
    key: Option<K>,
    index: usize,
    shards: Arc<Vec<Shard<K>>>,
}

impl<K> Drop for KeyGuard<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        drop(self.guard.take());
        let Some(key) = self.key.take() else {
            return;
        };

        let mut shard = self.shards[self.index].lock().unwrap_or_else(|e| e.into_inner());
        // Only the map holds the mutex once every guard and waiter is gone.
        if shard.get(&key).is_some_and(|m| Arc::strong_count(m) == 1) {
            shard.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();

        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock("resource").await;
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock(1_u32).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(2_u32)).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }
}
