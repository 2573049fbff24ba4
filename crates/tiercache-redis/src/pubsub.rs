//! Redis Pub/Sub transport for cross-node invalidation.
//!
//! ## How It Works
//!
//! ```text
//! Node A: cache.evict("orders", 42)
//!   ↓
//! Redis Pub/Sub: PUBLISH tiercache:invalidation {"type":"KEY",...,"originNodeId":"A"}
//!   ↓
//! Node A listener: originNodeId == A → ignored
//! Node B listener: handler drops the key from its L1
//! ```
//!
//! Each channel runs one listener task. The task reconnects with exponential
//! backoff when the pub/sub connection drops.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use futures_util::StreamExt;
use parking_lot::Mutex;
use redis::AsyncCommands;
use tiercache_core::{
    CacheError, CacheResult, InvalidationChannel, InvalidationHandler, InvalidationMessage,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);
/// How long `subscribe` waits for the first subscription to be confirmed.
const SUBSCRIBE_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Invalidation channel on a Redis topic, bound to one node id.
pub struct RedisInvalidationChannel {
    pool: Pool,
    redis_url: String,
    topic: String,
    node_id: String,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl RedisInvalidationChannel {
    pub fn new(
        pool: Pool,
        redis_url: impl Into<String>,
        topic: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            redis_url: redis_url.into(),
            topic: topic.into(),
            node_id: node_id.into(),
            listener: Mutex::new(None),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for RedisInvalidationChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl InvalidationChannel for RedisInvalidationChannel {
    async fn publish(&self, message: &InvalidationMessage) -> CacheResult<()> {
        let payload = message.to_json()?;
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::channel(format!("failed to get Redis connection: {e}")))?;

        let receivers: i64 = conn
            .publish(&self.topic, payload)
            .await
            .map_err(|e| CacheError::channel(format!("failed to publish invalidation: {e}")))?;

        tracing::debug!(
            topic = %self.topic,
            kind = ?message.kind,
            cache = message.cache_name.as_deref().unwrap_or("*"),
            receivers,
            "published cache invalidation"
        );
        Ok(())
    }

    async fn subscribe(&self, handler: Arc<dyn InvalidationHandler>) -> CacheResult<()> {
        let (ready_tx, ready_rx) = oneshot::channel();
        {
            let mut listener = self.listener.lock();
            if listener.as_ref().is_some_and(|handle| !handle.is_finished()) {
                return Ok(());
            }
            let task = ListenerTask {
                redis_url: self.redis_url.clone(),
                topic: self.topic.clone(),
                node_id: self.node_id.clone(),
                handler,
            };
            *listener = Some(tokio::spawn(task.run_forever(ready_tx)));
        }

        match tokio::time::timeout(SUBSCRIBE_CONFIRM_TIMEOUT, ready_rx).await {
            Ok(Ok(())) => Ok(()),
            // The task keeps retrying in the background either way.
            Ok(Err(_)) | Err(_) => Err(CacheError::channel(format!(
                "subscription to '{}' not confirmed, listener keeps retrying",
                self.topic
            ))),
        }
    }

    async fn unsubscribe(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
            tracing::info!(topic = %self.topic, node_id = %self.node_id, "invalidation listener stopped");
        }
    }
}

struct ListenerTask {
    redis_url: String,
    topic: String,
    node_id: String,
    handler: Arc<dyn InvalidationHandler>,
}

impl ListenerTask {
    async fn run_forever(self, ready: oneshot::Sender<()>) {
        let mut ready = Some(ready);
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match self.run(&mut ready).await {
                Ok(()) => {
                    tracing::warn!(topic = %self.topic, "pub/sub stream ended, resubscribing");
                    backoff = INITIAL_BACKOFF;
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        topic = %self.topic,
                        "invalidation listener error, reconnecting"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn run(&self, ready: &mut Option<oneshot::Sender<()>>) -> Result<(), String> {
        let client = redis::Client::open(self.redis_url.clone())
            .map_err(|e| format!("failed to create Redis client: {e}"))?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| format!("failed to get pub/sub connection: {e}"))?;
        pubsub
            .subscribe(&self.topic)
            .await
            .map_err(|e| format!("failed to subscribe: {e}"))?;

        tracing::info!(topic = %self.topic, node_id = %self.node_id, "subscribed to invalidation topic");
        if let Some(ready) = ready.take() {
            let _ = ready.send(());
        }

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(error = %e, "invalidation payload is not a string");
                    continue;
                }
            };
            match InvalidationMessage::from_json(&payload) {
                Ok(message) if message.is_from(&self.node_id) => {}
                Ok(message) => self.handler.handle(message),
                Err(e) => tracing::warn!(error = %e, "failed to parse invalidation message"),
            }
        }
        Ok(())
    }
}
