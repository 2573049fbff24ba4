//! Redis connection settings and pool construction.

use std::time::Duration;

use deadpool_redis::{Pool, Runtime};
use serde::{Deserialize, Serialize};
use tiercache_core::{CacheError, CacheResult};

/// Redis configuration for the shared tier and the invalidation topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis. Without it the engine runs with the local tier only.
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Pool wait/create/recycle timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    /// Pub/sub topic shared by every node of the namespace
    #[serde(default = "default_invalidation_topic")]
    pub topic: String,
}

fn default_redis_enabled() -> bool {
    false
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

fn default_invalidation_topic() -> String {
    "tiercache:invalidation".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
            topic: default_invalidation_topic(),
        }
    }
}

impl RedisConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        if !(self.url.starts_with("redis://")
            || self.url.starts_with("rediss://")
            || self.url.starts_with("unix://"))
        {
            return Err(format!("redis.url '{}' is not a redis:// URL", self.url));
        }
        if self.pool_size == 0 {
            return Err("redis.pool_size must be positive".into());
        }
        if self.timeout_ms == 0 {
            return Err("redis.timeout_ms must be positive".into());
        }
        if self.topic.trim().is_empty() {
            return Err("redis.topic must not be empty".into());
        }
        Ok(())
    }
}

/// Builds a connection pool and checks that Redis answers.
pub async fn create_pool(config: &RedisConfig) -> CacheResult<Pool> {
    let timeout = Duration::from_millis(config.timeout_ms);

    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    let pool_config = redis_config
        .pool
        .get_or_insert_with(|| deadpool_redis::PoolConfig::new(config.pool_size));
    pool_config.max_size = config.pool_size;
    pool_config.timeouts.wait = Some(timeout);
    pool_config.timeouts.create = Some(timeout);
    pool_config.timeouts.recycle = Some(timeout);

    let pool = redis_config
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| CacheError::remote(format!("failed to create Redis pool: {e}")))?;

    let mut conn = pool
        .get()
        .await
        .map_err(|e| CacheError::remote(format!("failed to connect to Redis: {e}")))?;
    let _: String = redis::cmd("PING")
        .query_async(&mut *conn)
        .await
        .map_err(|e| CacheError::remote(format!("Redis did not answer PING: {e}")))?;

    tracing::info!(url = %config.url, pool_size = config.pool_size, "connected to Redis");
    Ok(pool)
}
