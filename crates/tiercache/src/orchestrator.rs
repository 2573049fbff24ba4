//! Two-tier cache orchestration.
//!
//! ## Tiers
//!
//! - **L1**: one bounded moka cache per cache-name in this process
//! - **L2**: a shared [`RemoteTier`] selected by the cache-name's cluster
//!
//! ## Read path
//!
//! 1. L1 hit returns immediately
//! 2. the membership filter may answer "definitely absent"
//! 3. L2 hit is backfilled into L1 with the local TTL
//!
//! Remote read failures degrade to a miss and are counted.
//!
//! ## Write path
//!
//! L2 first, then L1, then a KEY invalidation for peers. A failed L2 write
//! fails the call and leaves L1 untouched.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tiercache_core::{
    ByteLoader, CacheEntry, CacheError, CacheResult, CacheSpecification, InvalidationChannel,
    InvalidationMessage, KeySerializer, LocalEntry, LocalTier, LocalTierFactory, Membership,
    MembershipFilter, RemoteTier, ResolvedKey, SpecRegistry, ToCacheKey, peek_version,
};
use tiercache_redis::{RedisInvalidationChannel, RedisRemoteTier, create_pool};
use tokio::time::Instant;

use crate::bloom::BloomMembershipFilter;
use crate::config::{CacheConfig, RemoteBus};
use crate::invalidation::InvalidationApplier;
use crate::local::{LocalCacheSet, MokaTierFactory};
use crate::locks::{DEFAULT_LOCK_CAPACITY, KeyedLocks};
use crate::metrics::{CacheEvent, CacheMetricsSnapshot, MetricsRegistry};

pub const DEFAULT_KEY_PREFIX: &str = "tiercache";
pub const DEFAULT_APPLICATION_NAME: &str = "application";
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Generates a node id of the form `hostname-uuid`.
pub fn generate_node_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string());
    format!("{host}-{}", uuid::Uuid::new_v4())
}

/// Multi-level cache engine.
pub struct TieredCache {
    node_id: String,
    serializer: Arc<KeySerializer>,
    specs: Arc<SpecRegistry>,
    locals: Arc<LocalCacheSet>,
    remotes: HashMap<String, Arc<dyn RemoteTier>>,
    channel: Option<Arc<dyn InvalidationChannel>>,
    filter: Option<Arc<dyn MembershipFilter>>,
    metrics: Arc<MetricsRegistry>,
    applier: Arc<InvalidationApplier>,
    load_locks: KeyedLocks,
    remote_timeout: Duration,
    load_timeout: Duration,
}

impl TieredCache {
    pub fn builder() -> TieredCacheBuilder {
        TieredCacheBuilder::default()
    }

    /// Builds an engine from configuration.
    ///
    /// With `redis.enabled` the default cluster is backed by Redis and, unless
    /// `default_remote_bus` is `LOCAL`, invalidations travel over Redis pub/sub.
    /// An unreachable Redis fails the call unless `allow_degradation` is set,
    /// in which case the engine runs with L1 only.
    pub async fn from_config(config: &CacheConfig) -> CacheResult<Self> {
        config.validate().map_err(CacheError::invalid_configuration)?;
        let node_id = config.node.id.clone().unwrap_or_else(generate_node_id);

        let mut builder = Self::builder()
            .with_node_id(&node_id)
            .with_key_prefix(&config.node.key_prefix)
            .with_application_name(&config.node.application_name)
            .with_specs(config.registry()?)
            .with_remote_timeout(config.remote_timeout())
            .with_load_timeout(config.load_timeout());

        if config.redis.enabled {
            match create_pool(&config.redis).await {
                Ok(pool) => {
                    builder = builder.with_cluster_remote(
                        &config.node.cluster_name,
                        Arc::new(RedisRemoteTier::new(pool.clone())),
                    );
                    if config.default_remote_bus == RemoteBus::Remote {
                        builder = builder.with_channel(Arc::new(RedisInvalidationChannel::new(
                            pool,
                            &config.redis.url,
                            &config.redis.topic,
                            &node_id,
                        )));
                    }
                }
                Err(e) if config.allow_degradation => {
                    tracing::warn!(error = %e, "Redis unavailable, running with the local tier only");
                }
                Err(e) => return Err(e),
            }
        }

        builder.build().await
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn serializer(&self) -> &KeySerializer {
        &self.serializer
    }

    pub fn specs(&self) -> &Arc<SpecRegistry> {
        &self.specs
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn metrics_snapshot(&self, cache_name: &str) -> CacheMetricsSnapshot {
        self.metrics.snapshot(cache_name)
    }

    /// The handler subscribed to the invalidation channel.
    pub fn invalidation_applier(&self) -> &Arc<InvalidationApplier> {
        &self.applier
    }

    /// L1 tier of a cache-name, if it was used already.
    pub fn local_tier(&self, cache_name: &str) -> Option<Arc<dyn LocalTier>> {
        self.locals.existing(cache_name)
    }

    pub fn has_remote(&self) -> bool {
        !self.remotes.is_empty()
    }

    /// Stops receiving invalidations.
    pub async fn shutdown(&self) {
        if let Some(channel) = &self.channel {
            channel.unsubscribe().await;
        }
        tracing::info!(node_id = %self.node_id, "cache engine shut down");
    }

    // ==================== Reads ====================

    pub async fn get<V, K>(&self, cache_name: &str, key: &K) -> CacheResult<Option<V>>
    where
        V: DeserializeOwned,
        K: ToCacheKey + ?Sized,
    {
        Ok(self
            .get_entry::<V, K>(cache_name, key)
            .await?
            .map(CacheEntry::into_value))
    }

    /// Like [`TieredCache::get`], keeping the entry's version.
    pub async fn get_entry<V, K>(&self, cache_name: &str, key: &K) -> CacheResult<Option<CacheEntry<V>>>
    where
        V: DeserializeOwned,
        K: ToCacheKey + ?Sized,
    {
        let spec = self.specs.resolve(cache_name)?;
        let resolved = self.serializer.resolve(cache_name, key)?;
        match self.lookup(cache_name, &spec, &resolved.full).await? {
            Some(bytes) => Ok(Some(CacheEntry::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn lookup(
        &self,
        cache_name: &str,
        spec: &CacheSpecification,
        full_key: &str,
    ) -> CacheResult<Option<Arc<[u8]>>> {
        let local = self.locals.tier(cache_name)?;
        if let Some(entry) = local.get(full_key) {
            tracing::debug!(cache = %cache_name, key = %full_key, "cache hit (L1)");
            self.metrics.record(cache_name, CacheEvent::L1Hit);
            return Ok(Some(entry.bytes));
        }

        let Some(remote) = self.remote_for(spec)? else {
            self.metrics.record(cache_name, CacheEvent::Miss);
            return Ok(None);
        };

        // Only answers the filter actually gave feed its false positive rate.
        let mut filtered = false;
        if let Some(filter) = self.filter_for(spec) {
            match filter.check(cache_name, full_key) {
                Membership::Absent => {
                    tracing::debug!(cache = %cache_name, key = %full_key, "filter short-circuit");
                    self.metrics
                        .record(cache_name, CacheEvent::FilterShortCircuit);
                    return Ok(None);
                }
                Membership::Maybe => {
                    self.metrics.record(cache_name, CacheEvent::FilterMaybe);
                    filtered = true;
                }
                Membership::Unknown => {}
            }
        }

        match self.remote_call("get", remote.get(full_key)).await {
            Ok(Some(bytes)) => {
                tracing::debug!(cache = %cache_name, key = %full_key, "cache hit (L2)");
                self.metrics.record(cache_name, CacheEvent::L2Hit);
                let bytes: Arc<[u8]> = bytes.into();
                self.backfill(cache_name, spec, &local, full_key, bytes.clone());
                Ok(Some(bytes))
            }
            Ok(None) => {
                tracing::debug!(cache = %cache_name, key = %full_key, "cache miss");
                self.metrics.record(cache_name, CacheEvent::Miss);
                if filtered {
                    self.metrics
                        .record(cache_name, CacheEvent::FilterFalsePositive);
                }
                Ok(None)
            }
            Err(e) if e.is_tier_unavailable() => {
                tracing::warn!(cache = %cache_name, key = %full_key, error = %e, "remote read failed, treating as miss");
                self.metrics.record(cache_name, CacheEvent::RemoteError);
                self.metrics.record(cache_name, CacheEvent::Miss);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn backfill(
        &self,
        cache_name: &str,
        spec: &CacheSpecification,
        local: &Arc<dyn LocalTier>,
        full_key: &str,
        bytes: Arc<[u8]>,
    ) {
        let version = peek_version(&bytes);
        let admitted = spec
            .local_ttl()
            .and_then(|ttl| local.put(full_key, LocalEntry::new(bytes, version, ttl)));
        match admitted {
            Ok(()) => self
                .metrics
                .record(cache_name, CacheEvent::BackfillSuccess),
            Err(e) => {
                tracing::warn!(cache = %cache_name, key = %full_key, error = %e, "L1 backfill failed");
                self.metrics
                    .record(cache_name, CacheEvent::BackfillFailure);
            }
        }
    }

    /// Batch lookup. Keys absent from both tiers are absent from the result.
    pub async fn get_all<V, K>(&self, cache_name: &str, keys: &[K]) -> CacheResult<HashMap<K, V>>
    where
        V: DeserializeOwned,
        K: ToCacheKey + Eq + Hash + Clone,
    {
        let spec = self.specs.resolve(cache_name)?;
        let local = self.locals.tier(cache_name)?;
        let mut found = HashMap::with_capacity(keys.len());
        let mut pending: Vec<(&K, String)> = Vec::new();

        for key in keys {
            let full = self.serializer.resolve(cache_name, key)?.full;
            match local.get(&full) {
                Some(entry) => {
                    self.metrics.record(cache_name, CacheEvent::L1Hit);
                    found.insert(key.clone(), CacheEntry::<V>::decode(&entry.bytes)?.value);
                }
                None => pending.push((key, full)),
            }
        }
        if pending.is_empty() {
            return Ok(found);
        }

        let Some(remote) = self.remote_for(&spec)? else {
            for _ in &pending {
                self.metrics.record(cache_name, CacheEvent::Miss);
            }
            return Ok(found);
        };

        if let Some(filter) = self.filter_for(&spec) {
            pending.retain(|(_, full)| match filter.check(cache_name, full) {
                Membership::Absent => {
                    self.metrics
                        .record(cache_name, CacheEvent::FilterShortCircuit);
                    false
                }
                Membership::Maybe => {
                    self.metrics.record(cache_name, CacheEvent::FilterMaybe);
                    true
                }
                Membership::Unknown => true,
            });
            if pending.is_empty() {
                return Ok(found);
            }
        }

        let full_keys: Vec<String> = pending.iter().map(|(_, full)| full.clone()).collect();
        let values = match self.remote_call("get_many", remote.get_many(&full_keys)).await {
            Ok(values) => values,
            Err(e) if e.is_tier_unavailable() => {
                tracing::warn!(cache = %cache_name, keys = full_keys.len(), error = %e, "remote batch read failed, treating as misses");
                self.metrics.record(cache_name, CacheEvent::RemoteError);
                for _ in &pending {
                    self.metrics.record(cache_name, CacheEvent::Miss);
                }
                return Ok(found);
            }
            Err(e) => return Err(e),
        };

        for ((key, full), value) in pending.into_iter().zip(values) {
            match value {
                Some(bytes) => {
                    self.metrics.record(cache_name, CacheEvent::L2Hit);
                    let bytes: Arc<[u8]> = bytes.into();
                    let entry = CacheEntry::<V>::decode(&bytes)?;
                    self.backfill(cache_name, &spec, &local, &full, bytes);
                    found.insert(key.clone(), entry.value);
                }
                None => {
                    self.metrics.record(cache_name, CacheEvent::Miss);
                    if filtered.is_some() {
                        self.metrics
                            .record(cache_name, CacheEvent::FilterFalsePositive);
                    }
                }
            }
        }
        Ok(found)
    }

    /// Whether a key is cached in either tier. Remote errors answer `false`.
    pub async fn exists<K>(&self, cache_name: &str, key: &K) -> CacheResult<bool>
    where
        K: ToCacheKey + ?Sized,
    {
        let spec = self.specs.resolve(cache_name)?;
        let full = self.serializer.resolve(cache_name, key)?.full;
        if self.locals.tier(cache_name)?.exists(&full) {
            return Ok(true);
        }
        let Some(remote) = self.remote_for(&spec)? else {
            return Ok(false);
        };
        if let Some(filter) = self.filter_for(&spec)
            && filter.check(cache_name, &full) == Membership::Absent
        {
            return Ok(false);
        }
        match self.remote_call("exists", remote.exists(&full)).await {
            Ok(exists) => Ok(exists),
            Err(e) if e.is_tier_unavailable() => {
                tracing::warn!(cache = %cache_name, key = %full, error = %e, "remote exists failed");
                self.metrics.record(cache_name, CacheEvent::RemoteError);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    // ==================== Writes ====================

    /// Writes a value to L2 then L1 and tells peers to drop their copy.
    pub async fn put<V, K>(&self, cache_name: &str, key: &K, value: &V, ttl: Option<Duration>) -> CacheResult<()>
    where
        V: Serialize + ?Sized,
        K: ToCacheKey + ?Sized,
    {
        self.put_entry(cache_name, key, &CacheEntry::new(value), ttl)
            .await
    }

    /// Writes a value carrying `version`. Peers holding a copy at the same or
    /// a newer version keep it.
    pub async fn put_versioned<V, K>(
        &self,
        cache_name: &str,
        key: &K,
        value: &V,
        version: u64,
        ttl: Option<Duration>,
    ) -> CacheResult<()>
    where
        V: Serialize + ?Sized,
        K: ToCacheKey + ?Sized,
    {
        self.put_entry(cache_name, key, &CacheEntry::versioned(value, version), ttl)
            .await
    }

    pub async fn put_entry<V, K>(
        &self,
        cache_name: &str,
        key: &K,
        entry: &CacheEntry<V>,
        ttl: Option<Duration>,
    ) -> CacheResult<()>
    where
        V: Serialize,
        K: ToCacheKey + ?Sized,
    {
        let spec = self.specs.resolve(cache_name)?;
        let resolved = self.serializer.resolve(cache_name, key)?;
        let bytes = entry.encode()?;
        let (remote_ttl, local_ttl) = spec.ttls_for(ttl)?;
        let local = self.locals.tier(cache_name)?;

        // Runs on its own task while the remote write is in flight.
        self.learn(cache_name, &spec, &resolved.full);

        if let Some(remote) = self.remote_for(&spec)? {
            self.remote_call("put", remote.put(&resolved.full, &bytes, remote_ttl))
                .await?;
        }
        local.put(
            &resolved.full,
            LocalEntry::new(bytes, entry.version, local_ttl),
        )?;
        tracing::debug!(cache = %cache_name, key = %resolved.full, ttl_secs = remote_ttl.as_secs(), "cache put");

        self.publish(InvalidationMessage::of_key(
            cache_name,
            &resolved.token,
            resolved.explicit_tenant().map(str::to_string),
            entry.version,
            &self.node_id,
        ))
        .await;
        Ok(())
    }

    /// Batch write with one remote round-trip.
    pub async fn put_all<V, K>(&self, cache_name: &str, entries: &[(K, V)], ttl: Option<Duration>) -> CacheResult<()>
    where
        V: Serialize,
        K: ToCacheKey,
    {
        if entries.is_empty() {
            return Ok(());
        }
        let spec = self.specs.resolve(cache_name)?;
        let (remote_ttl, local_ttl) = spec.ttls_for(ttl)?;
        let local = self.locals.tier(cache_name)?;

        let mut encoded: Vec<(ResolvedKey, Vec<u8>)> = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let resolved = self.serializer.resolve(cache_name, key)?;
            encoded.push((resolved, CacheEntry::new(value).encode()?));
        }
        for (resolved, _) in &encoded {
            self.learn(cache_name, &spec, &resolved.full);
        }

        if let Some(remote) = self.remote_for(&spec)? {
            let batch: Vec<(String, Vec<u8>)> = encoded
                .iter()
                .map(|(resolved, bytes)| (resolved.full.clone(), bytes.clone()))
                .collect();
            self.remote_call("put_many", remote.put_many(&batch, remote_ttl))
                .await?;
        }
        for (resolved, bytes) in &encoded {
            local.put(
                &resolved.full,
                LocalEntry::new(bytes.clone(), None, local_ttl),
            )?;
        }

        for (resolved, _) in &encoded {
            self.publish(InvalidationMessage::of_key(
                cache_name,
                &resolved.token,
                resolved.explicit_tenant().map(str::to_string),
                None,
                &self.node_id,
            ))
            .await;
        }
        Ok(())
    }

    /// Stores the value only if the key is absent from L2. Returns `true` if
    /// stored. Requires a remote tier with native conditional writes.
    pub async fn put_if_absent<V, K>(
        &self,
        cache_name: &str,
        key: &K,
        value: &V,
        ttl: Option<Duration>,
    ) -> CacheResult<bool>
    where
        V: Serialize + ?Sized,
        K: ToCacheKey + ?Sized,
    {
        let spec = self.specs.resolve(cache_name)?;
        let remote = match self.remote_for(&spec)? {
            Some(remote) if remote.supports_conditional_write() => remote,
            _ => {
                return Err(CacheError::invalid_configuration(format!(
                    "cache '{cache_name}' has no remote tier with conditional writes"
                )));
            }
        };
        let resolved = self.serializer.resolve(cache_name, key)?;
        let bytes = CacheEntry::new(value).encode()?;
        let (remote_ttl, local_ttl) = spec.ttls_for(ttl)?;

        let stored = self
            .remote_call(
                "put_if_absent",
                remote.put_if_absent(&resolved.full, &bytes, remote_ttl),
            )
            .await?;
        if stored {
            self.locals
                .tier(cache_name)?
                .put(&resolved.full, LocalEntry::new(bytes, None, local_ttl))?;
            self.learn(cache_name, &spec, &resolved.full);
        }
        Ok(stored)
    }

    /// Whether writes to `cache_name` can use [`TieredCache::put_if_absent`].
    pub fn supports_conditional_write(&self, cache_name: &str) -> CacheResult<bool> {
        let spec = self.specs.resolve(cache_name)?;
        Ok(self
            .remote_for(&spec)?
            .is_some_and(|remote| remote.supports_conditional_write()))
    }

    // ==================== Evictions ====================

    /// Drops a key from both tiers and from peers' L1.
    ///
    /// Peers are notified even if the remote delete fails; the remote error is
    /// returned afterwards. Returns `true` if either tier held the key.
    pub async fn evict<K>(&self, cache_name: &str, key: &K) -> CacheResult<bool>
    where
        K: ToCacheKey + ?Sized,
    {
        let spec = self.specs.resolve(cache_name)?;
        let resolved = self.serializer.resolve(cache_name, key)?;

        let local_removed = self
            .locals
            .existing(cache_name)
            .is_some_and(|local| local.delete(&resolved.full));
        let remote_removed = match self.remote_for(&spec)? {
            Some(remote) => {
                self.remote_call("delete", remote.delete(&resolved.full))
                    .await
            }
            None => Ok(false),
        };
        self.metrics.record(cache_name, CacheEvent::Eviction);

        self.publish(InvalidationMessage::of_key(
            cache_name,
            &resolved.token,
            resolved.explicit_tenant().map(str::to_string),
            None,
            &self.node_id,
        ))
        .await;

        let remote_removed = remote_removed?;
        tracing::debug!(cache = %cache_name, key = %resolved.full, local_removed, remote_removed, "cache evict");
        Ok(local_removed || remote_removed)
    }

    /// Batch eviction. Returns the number of keys removed from L2, or from L1
    /// when there is no remote tier.
    pub async fn evict_all<K>(&self, cache_name: &str, keys: &[K]) -> CacheResult<u64>
    where
        K: ToCacheKey,
    {
        let spec = self.specs.resolve(cache_name)?;
        let mut resolved = Vec::with_capacity(keys.len());
        for key in keys {
            resolved.push(self.serializer.resolve(cache_name, key)?);
        }

        let mut local_removed = 0;
        if let Some(local) = self.locals.existing(cache_name) {
            for key in &resolved {
                if local.delete(&key.full) {
                    local_removed += 1;
                }
            }
        }
        let remote_removed = match self.remote_for(&spec)? {
            Some(remote) => {
                let full: Vec<String> = resolved.iter().map(|key| key.full.clone()).collect();
                self.remote_call("delete_many", remote.delete_many(&full))
                    .await
                    .map(Some)
            }
            None => Ok(None),
        };
        for key in &resolved {
            self.metrics.record(cache_name, CacheEvent::Eviction);
            self.publish(InvalidationMessage::of_key(
                cache_name,
                &key.token,
                key.explicit_tenant().map(str::to_string),
                None,
                &self.node_id,
            ))
            .await;
        }
        Ok(remote_removed?.unwrap_or(local_removed))
    }

    /// Drops every entry of a cache-name, in every tenant, on every node.
    pub async fn clear(&self, cache_name: &str) -> CacheResult<()> {
        let spec = self.specs.resolve(cache_name)?;
        if let Some(local) = self.locals.existing(cache_name) {
            local.clear();
        }
        let remote_cleared = match self.remote_for(&spec)? {
            Some(remote) => {
                let pattern = self.serializer.cache_pattern(cache_name)?;
                self.remote_call("clear", remote.clear(&pattern))
                    .await
                    .map(Some)
            }
            None => Ok(None),
        };
        self.publish(InvalidationMessage::of_cache(cache_name, &self.node_id))
            .await;
        let removed = remote_cleared?;
        tracing::info!(cache = %cache_name, removed = ?removed, "cache cleared");
        Ok(())
    }

    /// Drops every entry of every cache-name of this application.
    pub async fn clear_all(&self) -> CacheResult<()> {
        self.locals.clear_all();
        let pattern = self.serializer.namespace_pattern();
        let mut first_error = None;
        for (cluster, remote) in &self.remotes {
            if let Err(e) = self.remote_call("clear", remote.clear(&pattern)).await {
                tracing::warn!(cluster = %cluster, error = %e, "remote clear failed");
                first_error.get_or_insert(e);
            }
        }
        self.publish(InvalidationMessage::of_all(&self.node_id)).await;
        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!(pattern = %pattern, "all caches cleared");
                Ok(())
            }
        }
    }

    // ==================== Loading ====================

    /// Returns the cached value or computes, stores and returns it.
    ///
    /// With a remote tier the remote coordinates concurrent loads of the key
    /// (a fleet-wide lock on Redis) and this node only backfills L1. If the
    /// remote fails before the loader started, the loader runs locally and
    /// the result is kept in L1; if it fails after, the loaded value is kept
    /// in L1 and returned. The load timeout covers remote work only, never
    /// the loader's own run time. Without a remote tier concurrent loads of a
    /// key in this process run one at a time and later callers reuse the
    /// first result.
    pub async fn get_or_load<V, K, F, Fut, E>(
        &self,
        cache_name: &str,
        key: &K,
        ttl: Option<Duration>,
        loader: F,
    ) -> CacheResult<V>
    where
        V: Serialize + DeserializeOwned + Send,
        K: ToCacheKey + ?Sized,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<V, E>> + Send,
        E: Into<anyhow::Error>,
    {
        let spec = self.specs.resolve(cache_name)?;
        let resolved = self.serializer.resolve(cache_name, key)?;
        let local = self.locals.tier(cache_name)?;

        if let Some(entry) = local.get(&resolved.full) {
            self.metrics.record(cache_name, CacheEvent::L1Hit);
            return Ok(CacheEntry::<V>::decode(&entry.bytes)?.value);
        }

        let Some(remote) = self.remote_for(&spec)? else {
            return self.load_locally(cache_name, key, &resolved, ttl, loader).await;
        };
        let (remote_ttl, local_ttl) = spec.ttls_for(ttl)?;

        let shared = Arc::new(Mutex::new(Some(loader)));
        let progress = Arc::new(LoadProgress::default());
        let remote_loader: ByteLoader<'_> = {
            let shared = shared.clone();
            let progress = progress.clone();
            Box::new(move || {
                async move {
                    let loader = shared
                        .lock()
                        .take()
                        .ok_or_else(|| CacheError::loader(anyhow::anyhow!("loader already ran")))?;
                    progress.started();
                    let value = loader().await.map_err(CacheError::loader)?;
                    let bytes = CacheEntry::new(value).encode()?;
                    progress.finished(&bytes);
                    Ok(bytes)
                }
                .boxed()
            })
        };

        let outcome = self
            .timed_load(
                &progress,
                remote.get_or_load(&resolved.full, remote_ttl, remote_loader),
            )
            .await;

        match outcome {
            Ok(bytes) => {
                let loaded_here = shared.lock().is_none();
                let event = if loaded_here {
                    CacheEvent::Miss
                } else {
                    CacheEvent::L2Hit
                };
                self.metrics.record(cache_name, event);
                let entry = CacheEntry::<V>::decode(&bytes)?;
                local.put(
                    &resolved.full,
                    LocalEntry::new(bytes, entry.version, local_ttl),
                )?;
                self.learn(cache_name, &spec, &resolved.full);
                Ok(entry.value)
            }
            Err(e @ CacheError::Loader(_)) => Err(e),
            Err(e) => {
                self.metrics.record(cache_name, CacheEvent::RemoteError);
                if let Some(bytes) = progress.loaded_bytes() {
                    tracing::warn!(cache = %cache_name, key = %resolved.full, error = %e, "remote failed after load, keeping the value in L1");
                    self.metrics.record(cache_name, CacheEvent::Miss);
                    let entry = CacheEntry::<V>::decode(&bytes)?;
                    local.put(&resolved.full, LocalEntry::new(bytes, None, local_ttl))?;
                    return Ok(entry.value);
                }
                let Some(loader) = shared.lock().take() else {
                    return Err(e);
                };
                tracing::warn!(cache = %cache_name, key = %resolved.full, error = %e, "remote load failed, loading locally");
                self.metrics.record(cache_name, CacheEvent::Miss);
                let value = loader().await.map_err(CacheError::loader)?;
                let bytes = CacheEntry::new(&value).encode()?;
                local.put(&resolved.full, LocalEntry::new(bytes, None, local_ttl))?;
                Ok(value)
            }
        }
    }

    async fn load_locally<V, K, F, Fut, E>(
        &self,
        cache_name: &str,
        key: &K,
        resolved: &ResolvedKey,
        ttl: Option<Duration>,
        loader: F,
    ) -> CacheResult<V>
    where
        V: Serialize + DeserializeOwned,
        K: ToCacheKey + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Into<anyhow::Error>,
    {
        let _guard = match self.load_locks.lock(&resolved.full).await {
            Ok(guard) => Some(guard),
            Err(e) => {
                tracing::debug!(key = %resolved.full, error = %e, "load lock unavailable, loading without it");
                None
            }
        };
        if let Some(entry) = self.locals.tier(cache_name)?.get(&resolved.full) {
            self.metrics.record(cache_name, CacheEvent::L1Hit);
            return Ok(CacheEntry::<V>::decode(&entry.bytes)?.value);
        }
        self.metrics.record(cache_name, CacheEvent::Miss);
        let value = loader().await.map_err(CacheError::loader)?;
        self.put(cache_name, key, &value, ttl).await?;
        Ok(value)
    }

    // ==================== Membership ====================

    /// Records every key L2 holds for `cache_name`, e.g. after a restart.
    ///
    /// Until this runs, or until the cache-name's remote TTL has passed since
    /// the filter was created, the filter never short-circuits a read.
    pub async fn warm_filter<K>(&self, cache_name: &str, keys: &[K]) -> CacheResult<()>
    where
        K: ToCacheKey,
    {
        let spec = self.specs.resolve(cache_name)?;
        let Some(filter) = self.filter_for(&spec) else {
            return Ok(());
        };
        let mut pending = Vec::with_capacity(keys.len());
        for key in keys {
            let full = self.serializer.resolve(cache_name, key)?.full;
            pending.push(filter.put_async(cache_name, &full));
        }
        join_all(pending).await;
        filter.mark_complete(cache_name);
        tracing::info!(cache = %cache_name, keys = keys.len(), "membership filter warmed");
        Ok(())
    }

    fn filter_for(&self, spec: &CacheSpecification) -> Option<&Arc<dyn MembershipFilter>> {
        self.filter.as_ref().filter(|_| spec.bloom_enabled())
    }

    fn learn(&self, cache_name: &str, spec: &CacheSpecification, full_key: &str) {
        if let Some(filter) = self.filter_for(spec) {
            // Detached: the insertion completes on its own task.
            drop(filter.put_async(cache_name, full_key));
        }
    }

    // ==================== Plumbing ====================

    fn remote_for(&self, spec: &CacheSpecification) -> CacheResult<Option<&Arc<dyn RemoteTier>>> {
        if self.remotes.is_empty() {
            return Ok(None);
        }
        match self.remotes.get(spec.cluster_name()) {
            Some(remote) => Ok(Some(remote)),
            None => Err(CacheError::invalid_configuration(format!(
                "no remote tier registered for cluster '{}'",
                spec.cluster_name()
            ))),
        }
    }

    async fn remote_call<T>(
        &self,
        operation: &str,
        call: impl Future<Output = CacheResult<T>>,
    ) -> CacheResult<T> {
        self.timed(self.remote_timeout, operation, call).await
    }

    async fn timed<T>(
        &self,
        limit: Duration,
        operation: &str,
        call: impl Future<Output = CacheResult<T>>,
    ) -> CacheResult<T> {
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::timeout(operation, limit)),
        }
    }

    /// Bounds the remote side of a coordinated load. The clock is paused
    /// while the loader runs and restarts once it has produced a value.
    async fn timed_load<T>(
        &self,
        progress: &LoadProgress,
        call: impl Future<Output = CacheResult<T>>,
    ) -> CacheResult<T> {
        let limit = self.load_timeout;
        let deadline = tokio::time::sleep(limit);
        tokio::pin!(call);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                result = &mut call => return result,
                () = &mut deadline => match progress.next_deadline(limit) {
                    Some(next) => deadline.as_mut().reset(next),
                    None => return Err(CacheError::timeout("get_or_load", limit)),
                },
            }
        }
    }

    async fn publish(&self, message: InvalidationMessage) {
        let Some(channel) = &self.channel else {
            return;
        };
        if let Err(e) = self
            .remote_call("publish", channel.publish(&message))
            .await
        {
            let cache_name = message.cache_name.as_deref().unwrap_or("*");
            tracing::warn!(cache = %cache_name, kind = ?message.kind, error = %e, "failed to broadcast invalidation");
            self.metrics
                .record(cache_name, CacheEvent::BroadcastFailure);
        }
    }
}

/// Where a remote-coordinated load stands, seen from the loader's side.
#[derive(Default)]
struct LoadProgress {
    state: Mutex<LoadState>,
}

#[derive(Default)]
enum LoadState {
    #[default]
    Waiting,
    Loading,
    Loaded { at: Instant, bytes: Vec<u8> },
}

impl LoadProgress {
    fn started(&self) {
        *self.state.lock() = LoadState::Loading;
    }

    fn finished(&self, bytes: &[u8]) {
        *self.state.lock() = LoadState::Loaded {
            at: Instant::now(),
            bytes: bytes.to_vec(),
        };
    }

    fn loaded_bytes(&self) -> Option<Vec<u8>> {
        match &*self.state.lock() {
            LoadState::Loaded { bytes, .. } => Some(bytes.clone()),
            _ => None,
        }
    }

    /// When the remote call should be checked again, or `None` once its
    /// remote side has used up `limit`.
    fn next_deadline(&self, limit: Duration) -> Option<Instant> {
        let now = Instant::now();
        match &*self.state.lock() {
            LoadState::Waiting => None,
            LoadState::Loading => Some(now + limit),
            LoadState::Loaded { at, .. } => Some(*at + limit).filter(|deadline| *deadline > now),
        }
    }
}

/// Builder for [`TieredCache`].
pub struct TieredCacheBuilder {
    node_id: Option<String>,
    key_prefix: String,
    application_name: String,
    specs: SpecRegistry,
    remotes: HashMap<String, Arc<dyn RemoteTier>>,
    channel: Option<Arc<dyn InvalidationChannel>>,
    local_factory: Arc<dyn LocalTierFactory>,
    filter: Option<Arc<dyn MembershipFilter>>,
    metrics: Option<Arc<MetricsRegistry>>,
    remote_timeout: Duration,
    load_timeout: Duration,
    load_lock_capacity: usize,
}

impl Default for TieredCacheBuilder {
    fn default() -> Self {
        Self {
            node_id: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
            specs: SpecRegistry::default(),
            remotes: HashMap::new(),
            channel: None,
            local_factory: Arc::new(MokaTierFactory),
            filter: None,
            metrics: None,
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
            load_timeout: DEFAULT_LOAD_TIMEOUT,
            load_lock_capacity: DEFAULT_LOCK_CAPACITY,
        }
    }
}

impl TieredCacheBuilder {
    /// Must match the node id the channel was created with.
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    pub fn with_specs(mut self, specs: SpecRegistry) -> Self {
        self.specs = specs;
        self
    }

    /// Registers the specification of one cache-name.
    pub fn with_cache(self, cache_name: &str, spec: CacheSpecification) -> CacheResult<Self> {
        self.specs.register(cache_name, spec)?;
        Ok(self)
    }

    /// Remote tier of the default cluster.
    pub fn with_remote(self, remote: Arc<dyn RemoteTier>) -> Self {
        let cluster = self.specs.defaults().cluster_name().to_string();
        self.with_cluster_remote(&cluster, remote)
    }

    pub fn with_cluster_remote(mut self, cluster: &str, remote: Arc<dyn RemoteTier>) -> Self {
        self.remotes.insert(cluster.to_string(), remote);
        self
    }

    pub fn with_channel(mut self, channel: Arc<dyn InvalidationChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_local_factory(mut self, factory: Arc<dyn LocalTierFactory>) -> Self {
        self.local_factory = factory;
        self
    }

    /// Replaces the bloom filter built by default.
    pub fn with_membership_filter(mut self, filter: Arc<dyn MembershipFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = timeout;
        self
    }

    pub fn with_load_lock_capacity(mut self, capacity: usize) -> Self {
        self.load_lock_capacity = capacity;
        self
    }

    /// Builds the engine and subscribes it to the invalidation channel.
    pub async fn build(self) -> CacheResult<TieredCache> {
        if self.remote_timeout.is_zero() || self.load_timeout.is_zero() {
            return Err(CacheError::invalid_configuration(
                "remote and load timeouts must be positive",
            ));
        }
        let node_id = self.node_id.unwrap_or_else(generate_node_id);
        let serializer = Arc::new(KeySerializer::new(
            self.key_prefix,
            &self.application_name,
        )?);
        let specs = Arc::new(self.specs);
        let metrics = self.metrics.unwrap_or_default();
        let locals = Arc::new(LocalCacheSet::new(specs.clone(), self.local_factory));
        let filter = self.filter.unwrap_or_else(|| {
            Arc::new(BloomMembershipFilter::new(specs.clone(), metrics.clone()))
                as Arc<dyn MembershipFilter>
        });

        let applier = Arc::new(InvalidationApplier::new(
            &node_id,
            locals.clone(),
            serializer.clone(),
            specs.clone(),
            Some(filter.clone()),
            metrics.clone(),
        ));

        if let Some(channel) = &self.channel
            && let Err(e) = channel.subscribe(applier.clone()).await
        {
            tracing::warn!(node_id = %node_id, error = %e, "invalidation subscription not confirmed");
        }

        tracing::info!(
            node_id = %node_id,
            application = %serializer.application(),
            remotes = self.remotes.len(),
            channel = self.channel.is_some(),
            "cache engine started"
        );

        Ok(TieredCache {
            node_id,
            serializer,
            specs,
            locals,
            remotes: self.remotes,
            channel: self.channel,
            filter: Some(filter),
            metrics,
            applier,
            load_locks: KeyedLocks::new(self.load_lock_capacity),
            remote_timeout: self.remote_timeout,
            load_timeout: self.load_timeout,
        })
    }
}
