//! In-process implementation of the shared tier.
//!
//! Cloning an [`InMemoryRemoteTier`] shares the underlying map, so several
//! engines in one process (simulated nodes) can address the same "remote"
//! data. Expiry uses tokio's clock and is enforced on access; expired
//! entries are also swept every [`SWEEP_EVERY_WRITES`] writes and on
//! `clear`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tiercache_core::{ByteLoader, CacheError, CacheResult, RemoteTier};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Writes between two sweeps of expired entries.
pub const SWEEP_EVERY_WRITES: u64 = 256;

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Instant,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Default)]
struct Shared {
    entries: DashMap<String, StoredValue>,
    load_locks: DashMap<String, Arc<Mutex<()>>>,
    unavailable: AtomicBool,
    writes: AtomicU64,
}

/// Shared map with TTLs, per-key load locks and conditional writes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRemoteTier {
    shared: Arc<Shared>,
}

impl InMemoryRemoteTier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: while unavailable every call fails with
    /// `TierUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.shared.unavailable.store(!available, Ordering::Relaxed);
    }

    /// Remaining TTL of a live key.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.shared
            .entries
            .get(key)
            .filter(|stored| stored.is_live(now))
            .map(|stored| stored.expires_at - now)
    }

    /// Live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .shared
            .entries
            .iter()
            .filter(|entry| entry.value().is_live(now))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Entries held, expired ones not yet swept included.
    pub fn stored_len(&self) -> usize {
        self.shared.entries.len()
    }

    /// Drops every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.shared.entries.len();
        self.shared.entries.retain(|_, stored| stored.is_live(now));
        let purged = before.saturating_sub(self.shared.entries.len());
        if purged > 0 {
            tracing::trace!(purged, "swept expired in-memory entries");
        }
        purged
    }

    fn note_write(&self) {
        let writes = self.shared.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_EVERY_WRITES == 0 {
            self.purge_expired();
        }
    }

    fn check_available(&self) -> CacheResult<()> {
        if self.shared.unavailable.load(Ordering::Relaxed) {
            return Err(CacheError::remote("in-memory tier marked unavailable"));
        }
        Ok(())
    }

    fn live_value(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let expired = match self.shared.entries.get(key) {
            Some(stored) if stored.is_live(now) => return Some(stored.bytes.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.shared
                .entries
                .remove_if(key, |_, stored| !stored.is_live(now));
        }
        None
    }

    fn store(&self, key: &str, value: &[u8], ttl: Duration) {
        self.shared.entries.insert(
            key.to_string(),
            StoredValue {
                bytes: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        self.note_write();
    }

    fn release_load_lock(&self, key: &str) {
        self.shared
            .load_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[async_trait]
impl RemoteTier for InMemoryRemoteTier {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.check_available()?;
        Ok(self.live_value(key))
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        self.check_available()?;
        self.store(key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .shared
            .entries
            .remove(key)
            .is_some_and(|(_, stored)| stored.is_live(now)))
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        self.check_available()?;
        Ok(self.live_value(key).is_some())
    }

    async fn clear(&self, pattern: &str) -> CacheResult<u64> {
        self.check_available()?;
        self.purge_expired();
        let before = self.shared.entries.len();
        self.shared
            .entries
            .retain(|key, _| !glob_matches(pattern, key));
        Ok(before.saturating_sub(self.shared.entries.len()) as u64)
    }

    fn supports_conditional_write(&self) -> bool {
        true
    }

    async fn put_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        let fresh = StoredValue {
            bytes: value.to_vec(),
            expires_at: now + ttl,
        };
        let stored = match self.shared.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(false);
                }
                occupied.insert(fresh);
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                true
            }
        };
        self.note_write();
        Ok(stored)
    }

    async fn get_or_load<'a>(
        &'a self,
        key: &'a str,
        ttl: Duration,
        loader: ByteLoader<'a>,
    ) -> CacheResult<Vec<u8>> {
        self.check_available()?;
        if let Some(bytes) = self.live_value(key) {
            return Ok(bytes);
        }

        let lock = self
            .shared
            .load_locks
            .entry(key.to_string())
            .or_default()
            .clone();
        let result = {
            let _guard = lock.lock().await;
            match self.live_value(key) {
                Some(bytes) => Ok(bytes),
                None => match loader().await {
                    Ok(bytes) => {
                        self.store(key, &bytes, ttl);
                        Ok(bytes)
                    }
                    Err(e) => Err(e),
                },
            }
        };
        drop(lock);
        self.release_load_lock(key);
        result
    }
}

/// Glob match where `*` matches any (possibly empty) run of characters and
/// every other character matches itself.
pub(crate) fn glob_matches(pattern: &str, text: &str) -> bool {
    let pattern = pattern.as_bytes();
    let text = text.as_bytes();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            backtrack = Some((p, t));
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&b| b == b'*')
}
