//! Tier, transport and filter traits.
//!
//! Tiers only ever see fully built key strings; none of them may assume the
//! type of the original key.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::error::{CacheError, CacheResult};
use crate::message::InvalidationMessage;
use crate::spec::CacheSpecification;

// ==================== Local tier ====================

/// An entry held by the local tier.
#[derive(Clone)]
pub struct LocalEntry {
    /// Encoded [`crate::CacheEntry`] bytes.
    pub bytes: Arc<[u8]>,
    /// Version copied from the entry, used by invalidation guards.
    pub version: Option<u64>,
    /// TTL the entry was admitted with.
    pub ttl: Duration,
    pub stored_at: Instant,
}

impl LocalEntry {
    pub fn new(bytes: impl Into<Arc<[u8]>>, version: Option<u64>, ttl: Duration) -> Self {
        Self {
            bytes: bytes.into(),
            version,
            ttl,
            stored_at: Instant::now(),
        }
    }

    /// Time left before the entry expires.
    pub fn remaining_ttl(&self) -> Duration {
        self.ttl.saturating_sub(self.stored_at.elapsed())
    }
}

impl fmt::Debug for LocalEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalEntry")
            .field("len", &self.bytes.len())
            .field("version", &self.version)
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// In-process cache for a single cache-name.
///
/// Implementations bound their size and expire entries by their own TTL.
pub trait LocalTier: Send + Sync {
    fn get(&self, key: &str) -> Option<LocalEntry>;

    /// Admits an entry. Fails only if the tier refuses it.
    fn put(&self, key: &str, entry: LocalEntry) -> CacheResult<()>;

    /// Removes a key, returning `true` if it was present.
    fn delete(&self, key: &str) -> bool;

    fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    fn clear(&self);

    /// Approximate number of live entries.
    fn entry_count(&self) -> u64;
}

/// Creates the local tier of a cache-name on first use.
pub trait LocalTierFactory: Send + Sync {
    fn create(&self, cache_name: &str, spec: &CacheSpecification) -> Arc<dyn LocalTier>;
}

// ==================== Remote tier ====================

/// Lazily produces the bytes to store on a `get_or_load` miss.
pub type ByteLoader<'a> = Box<dyn FnOnce() -> BoxFuture<'a, CacheResult<Vec<u8>>> + Send + 'a>;

/// Shared, authoritative key/value tier with server-side TTL.
///
/// Every method reports backend failures as [`CacheError::TierUnavailable`].
#[async_trait]
pub trait RemoteTier: Send + Sync {
    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Batch get; the result is positionally aligned with `keys`.
    async fn get_many(&self, keys: &[String]) -> CacheResult<Vec<Option<Vec<u8>>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()>;

    async fn put_many(&self, entries: &[(String, Vec<u8>)], ttl: Duration) -> CacheResult<()> {
        for (key, value) in entries {
            self.put(key, value, ttl).await?;
        }
        Ok(())
    }

    /// Removes a key, returning `true` if it existed.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Removes keys, returning how many existed.
    async fn delete_many(&self, keys: &[String]) -> CacheResult<u64> {
        let mut removed = 0;
        for key in keys {
            if self.delete(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Removes every key matching a glob where `*` matches any run of
    /// characters. Returns the number of keys removed.
    async fn clear(&self, pattern: &str) -> CacheResult<u64>;

    /// Whether [`RemoteTier::put_if_absent`] is a native atomic operation.
    fn supports_conditional_write(&self) -> bool {
        false
    }

    /// Stores `value` only if `key` is absent. Returns `true` if stored.
    async fn put_if_absent(&self, _key: &str, _value: &[u8], _ttl: Duration) -> CacheResult<bool> {
        Err(CacheError::invalid_configuration(format!(
            "{} tier has no conditional write",
            self.backend_name()
        )))
    }

    /// Returns the stored bytes, or runs `loader` once and stores its result.
    ///
    /// Implementations that can coordinate across callers (locks, leases)
    /// override this so concurrent misses compute the value only once. The
    /// loader must not be invoked when an error is returned before loading
    /// starts. A failed store after a successful load is logged and the loaded
    /// bytes are still returned.
    async fn get_or_load<'a>(
        &'a self,
        key: &'a str,
        ttl: Duration,
        loader: ByteLoader<'a>,
    ) -> CacheResult<Vec<u8>> {
        if let Some(bytes) = self.get(key).await? {
            return Ok(bytes);
        }
        let bytes = loader().await?;
        if let Err(e) = self.put(key, &bytes, ttl).await {
            tracing::warn!(key = %key, error = %e, "failed to store loaded value");
        }
        Ok(bytes)
    }
}

// ==================== Invalidation ====================

/// Receives invalidation messages from other nodes.
pub trait InvalidationHandler: Send + Sync {
    fn handle(&self, message: InvalidationMessage);
}

impl<F> InvalidationHandler for F
where
    F: Fn(InvalidationMessage) + Send + Sync,
{
    fn handle(&self, message: InvalidationMessage) {
        self(message)
    }
}

/// Publish/subscribe transport for invalidation messages.
///
/// Channels are bound to a node id and never hand a node its own messages.
#[async_trait]
pub trait InvalidationChannel: Send + Sync {
    /// Broadcasts a message to every other subscribed node.
    async fn publish(&self, message: &InvalidationMessage) -> CacheResult<()>;

    /// Registers the handler for incoming messages. Subscribing twice is a no-op.
    async fn subscribe(&self, handler: Arc<dyn InvalidationHandler>) -> CacheResult<()>;

    /// Stops delivery. Idempotent.
    async fn unsubscribe(&self);
}

// ==================== Membership ====================

/// A membership filter's answer for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    /// Definitely not in the shared tier.
    Absent,
    /// Possibly in the shared tier.
    Maybe,
    /// The filter cannot rule anything out yet, e.g. right after a restart.
    Unknown,
}

/// Per cache-name probabilistic set of existing keys.
pub trait MembershipFilter: Send + Sync {
    /// `false` means the key is definitely absent. Errors answer `true`.
    fn might_contain(&self, cache_name: &str, key: &str) -> bool;

    /// Like [`MembershipFilter::might_contain`], telling a real "maybe" apart
    /// from a filter that has no basis for an answer.
    fn check(&self, cache_name: &str, key: &str) -> Membership {
        if self.might_contain(cache_name, key) {
            Membership::Maybe
        } else {
            Membership::Absent
        }
    }

    /// Records a key without blocking the caller.
    fn put_async(&self, cache_name: &str, key: &str) -> BoxFuture<'static, ()>;

    /// Declares that every key the shared tier holds for `cache_name` has
    /// been recorded, so negative answers can be trusted from now on.
    fn mark_complete(&self, _cache_name: &str) {}
}
