//! In-process invalidation transport.
//!
//! One [`InMemoryInvalidationBus`] stands in for the shared topic; every
//! simulated node connects its own [`InMemoryInvalidationChannel`]. Delivery
//! is synchronous: `publish` returns after every other subscriber ran its
//! handler. The bus keeps only the most recent messages for inspection.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tiercache_core::{CacheResult, InvalidationChannel, InvalidationHandler, InvalidationMessage};

struct Subscriber {
    node_id: String,
    handler: Arc<dyn InvalidationHandler>,
}

/// Messages kept by [`InMemoryInvalidationBus::published`] by default.
pub const DEFAULT_HISTORY: usize = 1_024;

/// The shared topic.
pub struct InMemoryInvalidationBus {
    subscribers: RwLock<Vec<Subscriber>>,
    published: Mutex<VecDeque<InvalidationMessage>>,
    history: usize,
}

impl Default for InMemoryInvalidationBus {
    fn default() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            published: Mutex::new(VecDeque::new()),
            history: DEFAULT_HISTORY,
        }
    }
}

impl InMemoryInvalidationBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A bus remembering at most `history` published messages; zero keeps none.
    pub fn with_history(history: usize) -> Arc<Self> {
        Arc::new(Self {
            history,
            ..Self::default()
        })
    }

    /// Creates the channel endpoint of `node_id`.
    pub fn connect(self: &Arc<Self>, node_id: impl Into<String>) -> Arc<InMemoryInvalidationChannel> {
        Arc::new(InMemoryInvalidationChannel {
            bus: self.clone(),
            node_id: node_id.into(),
        })
    }

    /// The most recently published messages, oldest first.
    pub fn published(&self) -> Vec<InvalidationMessage> {
        self.published.lock().iter().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn deliver(&self, message: &InvalidationMessage) -> usize {
        if self.history > 0 {
            let mut published = self.published.lock();
            if published.len() == self.history {
                published.pop_front();
            }
            published.push_back(message.clone());
        }

        // Snapshot handlers so a handler may publish without deadlocking.
        let targets: Vec<Arc<dyn InvalidationHandler>> = self
            .subscribers
            .read()
            .iter()
            .filter(|subscriber| !message.is_from(&subscriber.node_id))
            .map(|subscriber| subscriber.handler.clone())
            .collect();
        for handler in &targets {
            handler.handle(message.clone());
        }
        targets.len()
    }
}

/// One node's endpoint on an [`InMemoryInvalidationBus`].
pub struct InMemoryInvalidationChannel {
    bus: Arc<InMemoryInvalidationBus>,
    node_id: String,
}

impl InMemoryInvalidationChannel {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

#[async_trait]
impl InvalidationChannel for InMemoryInvalidationChannel {
    async fn publish(&self, message: &InvalidationMessage) -> CacheResult<()> {
        let delivered = self.bus.deliver(message);
        tracing::trace!(
            node_id = %self.node_id,
            kind = ?message.kind,
            delivered,
            "invalidation published in-process"
        );
        Ok(())
    }

    async fn subscribe(&self, handler: Arc<dyn InvalidationHandler>) -> CacheResult<()> {
        let mut subscribers = self.bus.subscribers.write();
        if subscribers.iter().any(|s| s.node_id == self.node_id) {
            return Ok(());
        }
        subscribers.push(Subscriber {
            node_id: self.node_id.clone(),
            handler,
        });
        Ok(())
    }

    async fn unsubscribe(&self) {
        self.bus
            .subscribers
            .write()
            .retain(|subscriber| subscriber.node_id != self.node_id);
    }
}
