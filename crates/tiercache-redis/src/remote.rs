//! Redis-backed shared tier.
//!
//! Values are stored as raw bytes with a millisecond TTL (`SET .. PX`).
//! `get_or_load` serializes concurrent loads of one key across the whole
//! fleet with a short-lived lock key (`SET NX PX` plus a compare-and-delete
//! release).

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};
use redis::AsyncCommands;
use tiercache_core::{ByteLoader, CacheError, CacheResult, RemoteTier};
use uuid::Uuid;

/// How long a load lock is held at most before Redis drops it.
const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(10);
/// Delay between checks while another node is loading.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Keys deleted per SCAN round of `clear`.
const SCAN_BATCH: usize = 500;

const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

fn remote_err(action: &str, e: impl std::fmt::Display) -> CacheError {
    CacheError::remote(format!("failed to {action}: {e}"))
}

/// Shared tier on a `deadpool-redis` pool.
#[derive(Clone)]
pub struct RedisRemoteTier {
    pool: Pool,
    lock_lease: Duration,
}

impl RedisRemoteTier {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            lock_lease: DEFAULT_LOCK_LEASE,
        }
    }

    /// Upper bound on how long one node may hold a load lock.
    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn conn(&self) -> CacheResult<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| remote_err("get Redis connection", e))
    }

    async fn try_lock(&self, lock_key: &str, token: &str) -> CacheResult<bool> {
        let mut conn = self.conn().await?;
        let acquired: Option<String> = redis::cmd("SET")
            .arg(lock_key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(self.lock_lease))
            .query_async(&mut conn)
            .await
            .map_err(|e| remote_err("acquire load lock", e))?;
        Ok(acquired.is_some())
    }

    async fn unlock(&self, lock_key: &str, token: &str) {
        let script = redis::Script::new(RELEASE_LOCK_SCRIPT);
        let result: CacheResult<i64> = async {
            let mut conn = self.conn().await?;
            let released: i64 = script
                .key(lock_key)
                .arg(token)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| remote_err("release load lock", e))?;
            Ok(released)
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(key = %lock_key, error = %e, "load lock not released, lease will expire");
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn lock_key_for(key: &str) -> String {
    format!("{key}:__load_lock")
}

#[async_trait]
impl RemoteTier for RedisRemoteTier {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        conn.get(key).await.map_err(|e| remote_err("GET", e))
    }

    async fn get_many(&self, keys: &[String]) -> CacheResult<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| remote_err("MGET", e))?;
        Ok(values)
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        conn.pset_ex::<_, _, ()>(key, value, ttl_millis(ttl))
            .await
            .map_err(|e| remote_err("SET", e))
    }

    async fn put_many(&self, entries: &[(String, Vec<u8>)], ttl: Duration) -> CacheResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            pipe.pset_ex(key, value.as_slice(), ttl_millis(ttl)).ignore();
        }
        let (): () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| remote_err("pipeline SET", e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.del(key).await.map_err(|e| remote_err("DEL", e))?;
        Ok(removed > 0)
    }

    async fn delete_many(&self, keys: &[String]) -> CacheResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let removed: u64 = conn.del(keys).await.map_err(|e| remote_err("DEL", e))?;
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.conn().await?;
        conn.exists(key).await.map_err(|e| remote_err("EXISTS", e))
    }

    async fn clear(&self, pattern: &str) -> CacheResult<u64> {
        let mut conn = self.conn().await?;
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| remote_err("SCAN", e))?;
            if !keys.is_empty() {
                let deleted: u64 = conn.del(&keys).await.map_err(|e| remote_err("DEL", e))?;
                removed += deleted;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        tracing::debug!(pattern = %pattern, removed, "cleared Redis keys");
        Ok(removed)
    }

    fn supports_conditional_write(&self) -> bool {
        true
    }

    async fn put_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.conn().await?;
        let stored: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| remote_err("SET NX", e))?;
        Ok(stored.is_some())
    }

    async fn get_or_load<'a>(
        &'a self,
        key: &'a str,
        ttl: Duration,
        loader: ByteLoader<'a>,
    ) -> CacheResult<Vec<u8>> {
        if let Some(bytes) = self.get(key).await? {
            return Ok(bytes);
        }

        let lock_key = lock_key_for(key);
        let token = Uuid::new_v4().to_string();
        let deadline = tokio::time::Instant::now() + self.lock_lease;

        loop {
            if self.try_lock(&lock_key, &token).await? {
                break;
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
            if let Some(bytes) = self.get(key).await? {
                tracing::debug!(key = %key, "value loaded by another node");
                return Ok(bytes);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CacheError::remote(format!(
                    "load lock for '{key}' still held after {}ms",
                    self.lock_lease.as_millis()
                )));
            }
        }

        // Another node may have finished between our GET and the lock.
        let outcome = match self.get(key).await {
            Ok(Some(bytes)) => Ok(bytes),
            Ok(None) | Err(_) => match loader().await {
                Ok(bytes) => {
                    if let Err(e) = self.put(key, &bytes, ttl).await {
                        tracing::warn!(key = %key, error = %e, "failed to store loaded value");
                    }
                    Ok(bytes)
                }
                Err(e) => Err(e),
            },
        };
        self.unlock(&lock_key, &token).await;
        outcome
    }
}
