//! Multi-level cache engine.
//!
//! [`TieredCache`] fronts a shared remote tier (Redis, or the in-memory tier
//! for single-box setups and tests) with a bounded in-process tier per
//! cache-name. Peers keep their local copies coherent through invalidation
//! messages, a bloom filter per cache-name answers "definitely absent" before
//! the remote tier is asked, and [`IdempotencyGuard`] builds event
//! deduplication on top of the same tiers.
//!
//! ```ignore
//! let config = tiercache::config::loader::load_config(None)?;
//! tiercache::observability::init_tracing_from(&config.logging);
//! let cache = std::sync::Arc::new(tiercache::TieredCache::from_config(&config).await?);
//!
//! cache.put("orders", &42_u64, &order, None).await?;
//! let order: Option<Order> = cache.get("orders", &42_u64).await?;
//!
//! let guard = tiercache::IdempotencyGuard::new(cache.clone(), &config.idempotency, config.allow_degradation)?;
//! if guard.check_and_set_atomic(&event_id).await? {
//!     handle(event).await;
//! }
//! ```

pub mod bloom;
pub mod config;
pub mod idempotency;
pub mod invalidation;
pub mod local;
pub mod locks;
pub mod metrics;
pub mod observability;
pub mod orchestrator;

pub use bloom::{BloomFilter, BloomMembershipFilter};
pub use config::{CacheConfig, CacheDefaults, CacheOverrides, IdempotencyConfig, RemoteBus};
pub use idempotency::{IdempotencyGuard, PROCESSED_MARKER};
pub use invalidation::{InvalidationApplier, InvalidationOutcome};
pub use local::{LocalCacheSet, MokaLocalTier, MokaTierFactory};
pub use locks::{KeyedLockGuard, KeyedLocks};
pub use metrics::{CacheEvent, CacheMetricsSnapshot, MetricsRegistry, init_metrics, render_metrics};
pub use observability::{apply_logging_level, init_tracing, init_tracing_with_level};
pub use orchestrator::{TieredCache, TieredCacheBuilder, generate_node_id};

pub use tiercache_core::{
    CacheEntry, CacheError, CacheKey, CacheResult, CacheSpecification, InvalidationKind,
    InvalidationMessage, Json, KeySerializer, TtlStrategy, with_tenant,
};
pub use tiercache_memory::{InMemoryInvalidationBus, InMemoryRemoteTier};
pub use tiercache_redis::{RedisConfig, RedisInvalidationChannel, RedisRemoteTier};
