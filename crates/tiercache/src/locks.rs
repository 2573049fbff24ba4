//! Bounded map of per-key async mutexes.
//!
//! An entry lives only while some caller holds or waits on its lock, so the
//! map never grows beyond the number of keys in flight. When `capacity` keys
//! are in flight, locking a new key fails with [`CacheError::LockTimeout`].

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tiercache_core::{CacheError, CacheResult};
use tokio::sync::{Mutex, OwnedMutexGuard};

pub const DEFAULT_LOCK_CAPACITY: usize = 1_000;

pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
    // Entries in `locks`, reserved before insertion so the bound is exact.
    reserved: AtomicUsize,
    capacity: usize,
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_CAPACITY)
    }
}

impl KeyedLocks {
    pub fn new(capacity: usize) -> Self {
        Self {
            locks: DashMap::new(),
            reserved: AtomicUsize::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn handle(&self, key: &str) -> CacheResult<Arc<Mutex<()>>> {
        if let Some(lock) = self.locks.get(key) {
            return Ok(lock.value().clone());
        }
        match self.locks.entry(key.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let capacity = self.capacity;
                self.reserved
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < capacity).then_some(n + 1)
                    })
                    .map_err(|_| CacheError::lock_timeout(key))?;
                Ok(entry.insert(Arc::new(Mutex::new(()))).value().clone())
            }
        }
    }

    fn release(&self, key: &str) {
        if self
            .locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1)
            .is_some()
        {
            self.reserved.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Waits for the lock of `key` without a deadline.
    pub async fn lock(&self, key: &str) -> CacheResult<KeyedLockGuard<'_>> {
        let handle = self.handle(key)?;
        let guard = handle.lock_owned().await;
        Ok(KeyedLockGuard {
            owner: self,
            key: key.to_string(),
            guard: Some(guard),
        })
    }

    /// Waits at most `wait` for the lock of `key`.
    pub async fn try_lock_for(&self, key: &str, wait: Duration) -> CacheResult<KeyedLockGuard<'_>> {
        let handle = self.handle(key)?;
        match tokio::time::timeout(wait, handle.lock_owned()).await {
            Ok(guard) => Ok(KeyedLockGuard {
                owner: self,
                key: key.to_string(),
                guard: Some(guard),
            }),
            Err(_) => {
                self.release(key);
                Err(CacheError::lock_timeout(key))
            }
        }
    }
}

/// Holds one key's lock; the map entry is dropped with the last user.
pub struct KeyedLockGuard<'a> {
    owner: &'a KeyedLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLockGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyedLockGuard<'_> {
    fn drop(&mut self) {
        // The guard owns one reference to the mutex; drop it before the count check.
        self.guard.take();
        self.owner.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entries_removed_after_release() {
        let locks = KeyedLocks::new(10);
        {
            let guard = locks.lock("a").await.unwrap();
            assert_eq!(guard.key(), "a");
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_second_caller_times_out() {
        let locks = KeyedLocks::new(10);
        let _held = locks.lock("a").await.unwrap();
        let err = locks
            .try_lock_for("a", Duration::from_millis(10))
            .await
            .err()
            .unwrap();
        assert!(err.is_lock_timeout());
        // The holder's entry survives the waiter giving up.
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_rejects_new_keys() {
        let locks = KeyedLocks::new(2);
        let _a = locks.lock("a").await.unwrap();
        let _b = locks.lock("b").await.unwrap();
        assert!(locks.lock("c").await.err().unwrap().is_lock_timeout());
        drop(_a);
        assert!(locks.lock("c").await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_capacity_holds_under_concurrent_new_keys() {
        let locks = Arc::new(KeyedLocks::new(4));
        let mut tasks = Vec::new();
        for i in 0..64 {
            let locks = locks.clone();
            tasks.push(tokio::spawn(async move {
                let Ok(_guard) = locks.lock(&format!("key-{i}")).await else {
                    return None;
                };
                let seen = locks.len();
                tokio::time::sleep(Duration::from_millis(50)).await;
                Some(seen)
            }));
        }
        let mut admitted = 0;
        for task in tasks {
            if let Some(seen) = task.await.unwrap() {
                admitted += 1;
                assert!(seen <= 4, "saw {seen} keys in flight");
            }
        }
        assert!(admitted >= 1);
        assert!(locks.is_empty());
        // Every reservation was returned.
        let mut held = Vec::new();
        for i in 0..4 {
            held.push(locks.lock(&format!("again-{i}")).await.unwrap());
        }
        assert!(locks.lock("one-more").await.err().unwrap().is_lock_timeout());
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let locks = Arc::new(KeyedLocks::new(10));
        let inside = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock("k").await.unwrap();
                let now = inside.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                assert_eq!(now, 0);
                tokio::task::yield_now().await;
                inside.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(locks.is_empty());
    }
}
