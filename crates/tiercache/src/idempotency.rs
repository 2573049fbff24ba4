//! Deduplication of processed events and operations.
//!
//! Markers live under a reserved cache-name in both tiers. Three flavors:
//!
//! - [`IdempotencyGuard::check_and_set`]: get-then-put, racy under concurrency
//! - [`IdempotencyGuard::check_and_set_atomic`]: the same under a per-key lock,
//!   exclusive within this process only
//! - [`IdempotencyGuard::check_and_set_exclusive`]: a conditional write on the
//!   remote tier, exclusive across processes

use std::sync::Arc;
use std::time::Duration;

use tiercache_core::{CacheError, CacheResult};

use crate::config::IdempotencyConfig;
use crate::locks::KeyedLocks;
use crate::orchestrator::TieredCache;

/// Value stored for a processed key.
pub const PROCESSED_MARKER: &str = "processed";

pub struct IdempotencyGuard {
    cache: Arc<TieredCache>,
    cache_name: String,
    ttl: Duration,
    locks: KeyedLocks,
    lock_retries: u32,
    lock_retry_delay: Duration,
    allow_degradation: bool,
}

impl IdempotencyGuard {
    /// Registers the marker cache-name (filter disabled) on `cache`.
    pub fn new(
        cache: Arc<TieredCache>,
        config: &IdempotencyConfig,
        allow_degradation: bool,
    ) -> CacheResult<Self> {
        let defaults = cache.specs().defaults().clone();
        let spec = defaults
            .to_builder()
            .ttl_remote(config.ttl)
            .bloom_enabled(false)
            .build()?;
        cache.specs().register(&config.cache_name, spec)?;

        Ok(Self {
            cache,
            cache_name: config.cache_name.clone(),
            ttl: config.ttl,
            locks: KeyedLocks::new(config.lock_capacity),
            lock_retries: config.lock_retries,
            lock_retry_delay: config.lock_retry_delay(),
            allow_degradation,
        })
    }

    /// Uses the default marker settings.
    pub fn with_defaults(cache: Arc<TieredCache>) -> CacheResult<Self> {
        Self::new(cache, &IdempotencyConfig::default(), false)
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Keys currently locked by `check_and_set_atomic`.
    pub fn locked_keys(&self) -> usize {
        self.locks.len()
    }

    /// Returns `true` the first time `key` is seen within the TTL.
    ///
    /// Not atomic: concurrent callers may all get `true`.
    pub async fn check_and_set(&self, key: &str) -> CacheResult<bool> {
        if key.trim().is_empty() {
            return Ok(true);
        }
        let seen: Option<String> = self.cache.get(&self.cache_name, key).await?;
        if seen.is_some() {
            tracing::debug!(key = %key, "duplicate detected");
            return Ok(false);
        }
        self.cache
            .put(&self.cache_name, key, PROCESSED_MARKER, Some(self.ttl))
            .await?;
        Ok(true)
    }

    /// Like [`IdempotencyGuard::check_and_set`] under a per-key lock.
    ///
    /// Exactly one concurrent caller in this process gets `true`. If the lock
    /// is not acquired within the retry budget the check runs unlocked.
    pub async fn check_and_set_atomic(&self, key: &str) -> CacheResult<bool> {
        if key.trim().is_empty() {
            return Ok(true);
        }
        let lock_key = self.cache.serializer().build_key(&self.cache_name, key)?;

        for attempt in 1..=self.lock_retries {
            match self.locks.try_lock_for(&lock_key, self.lock_retry_delay).await {
                Ok(_guard) => return self.check_and_set(key).await,
                Err(e) if e.is_lock_timeout() => {
                    tracing::debug!(key = %key, attempt, "idempotency lock busy");
                }
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(
            key = %key,
            retries = self.lock_retries,
            "idempotency lock not acquired, checking without it"
        );
        self.check_and_set(key).await
    }

    /// Cross-process variant backed by the remote tier's conditional write.
    ///
    /// Without conditional writes this degrades to
    /// [`IdempotencyGuard::check_and_set_atomic`] when degradation is allowed
    /// and fails with `InvalidConfiguration` otherwise.
    pub async fn check_and_set_exclusive(&self, key: &str) -> CacheResult<bool> {
        if key.trim().is_empty() {
            return Ok(true);
        }
        if self.cache.supports_conditional_write(&self.cache_name)? {
            return self
                .cache
                .put_if_absent(&self.cache_name, key, PROCESSED_MARKER, Some(self.ttl))
                .await;
        }
        if self.allow_degradation {
            tracing::debug!(key = %key, "no conditional write, using process-local lock");
            return self.check_and_set_atomic(key).await;
        }
        Err(CacheError::invalid_configuration(format!(
            "cache '{}' has no conditional write and degradation is disabled",
            self.cache_name
        )))
    }

    /// Forgets a key so it can be processed again.
    pub async fn clear(&self, key: &str) -> CacheResult<bool> {
        if key.trim().is_empty() {
            return Ok(false);
        }
        self.cache.evict(&self.cache_name, key).await
    }
}

impl std::fmt::Debug for IdempotencyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyGuard")
            .field("cache_name", &self.cache_name)
            .field("ttl", &self.ttl)
            .field("lock_retries", &self.lock_retries)
            .finish()
    }
}
