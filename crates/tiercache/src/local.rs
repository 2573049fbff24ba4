//! In-process (L1) tier on moka.
//!
//! One bounded cache per cache-name, created on first use from the
//! cache-name's specification. Entries expire after their own TTL and the
//! least recently used entry is evicted when the cache is full.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use moka::Expiry;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use tiercache_core::{
    CacheResult, CacheSpecification, LocalEntry, LocalTier, LocalTierFactory, SpecRegistry,
};

struct EntryExpiry;

impl Expiry<String, LocalEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &LocalEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &LocalEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// L1 tier for one cache-name.
#[derive(Clone)]
pub struct MokaLocalTier {
    cache: Cache<String, LocalEntry>,
}

impl MokaLocalTier {
    pub fn new(max_entries: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(EntryExpiry)
            .build();
        Self { cache }
    }

    /// Applies pending evictions so `entry_count` is exact. Tests only need this.
    pub fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks();
    }
}

impl LocalTier for MokaLocalTier {
    fn get(&self, key: &str) -> Option<LocalEntry> {
        self.cache.get(key)
    }

    fn put(&self, key: &str, entry: LocalEntry) -> CacheResult<()> {
        self.cache.insert(key.to_string(), entry);
        Ok(())
    }

    fn delete(&self, key: &str) -> bool {
        self.cache.remove(key).is_some()
    }

    fn exists(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    fn clear(&self) {
        self.cache.invalidate_all();
    }

    fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

/// Creates a [`MokaLocalTier`] sized from the specification.
#[derive(Debug, Clone, Copy, Default)]
pub struct MokaTierFactory;

impl LocalTierFactory for MokaTierFactory {
    fn create(&self, _cache_name: &str, spec: &CacheSpecification) -> Arc<dyn LocalTier> {
        Arc::new(MokaLocalTier::new(spec.local_max_entries()))
    }
}

/// The L1 tiers of every cache-name used so far.
pub struct LocalCacheSet {
    specs: Arc<SpecRegistry>,
    factory: Arc<dyn LocalTierFactory>,
    tiers: DashMap<String, Arc<dyn LocalTier>>,
}

impl LocalCacheSet {
    pub fn new(specs: Arc<SpecRegistry>, factory: Arc<dyn LocalTierFactory>) -> Self {
        Self {
            specs,
            factory,
            tiers: DashMap::new(),
        }
    }

    /// Returns the tier of `cache_name`, creating it on first use.
    pub fn tier(&self, cache_name: &str) -> CacheResult<Arc<dyn LocalTier>> {
        if let Some(tier) = self.tiers.get(cache_name) {
            return Ok(tier.value().clone());
        }
        let spec = self.specs.resolve(cache_name)?;
        let tier = self
            .tiers
            .entry(cache_name.to_string())
            .or_insert_with(|| {
                tracing::debug!(cache = %cache_name, max_entries = spec.local_max_entries(), "creating local tier");
                self.factory.create(cache_name, &spec)
            })
            .value()
            .clone();
        Ok(tier)
    }

    /// Returns the tier of `cache_name` only if it was already created.
    pub fn existing(&self, cache_name: &str) -> Option<Arc<dyn LocalTier>> {
        self.tiers.get(cache_name).map(|tier| tier.value().clone())
    }

    /// Clears every tier created so far.
    pub fn clear_all(&self) {
        for tier in self.tiers.iter() {
            tier.value().clear();
        }
    }

    pub fn cache_names(&self) -> Vec<String> {
        self.tiers.iter().map(|tier| tier.key().clone()).collect()
    }
}
