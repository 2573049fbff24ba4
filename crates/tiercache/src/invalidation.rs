//! Applies invalidation messages from peer nodes to the local tiers.

use std::sync::Arc;

use tiercache_core::{
    InvalidationHandler, InvalidationKind, InvalidationMessage, KeySerializer, MembershipFilter,
    SpecRegistry,
};

use crate::local::LocalCacheSet;
use crate::metrics::{CacheEvent, MetricsRegistry};

/// What happened to one received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationOutcome {
    /// Local entries were dropped (or there was nothing to drop).
    Applied,
    /// The local entry carries a version at least as new as the message.
    Skipped,
    /// Own message, or a message that could not be interpreted.
    Ignored,
}

/// [`InvalidationHandler`] that drops peers' writes from this node's L1.
pub struct InvalidationApplier {
    node_id: String,
    locals: Arc<LocalCacheSet>,
    serializer: Arc<KeySerializer>,
    specs: Arc<SpecRegistry>,
    filter: Option<Arc<dyn MembershipFilter>>,
    metrics: Arc<MetricsRegistry>,
}

impl InvalidationApplier {
    pub fn new(
        node_id: impl Into<String>,
        locals: Arc<LocalCacheSet>,
        serializer: Arc<KeySerializer>,
        specs: Arc<SpecRegistry>,
        filter: Option<Arc<dyn MembershipFilter>>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            locals,
            serializer,
            specs,
            filter,
            metrics,
        }
    }

    pub fn apply(&self, message: &InvalidationMessage) -> InvalidationOutcome {
        if message.is_from(&self.node_id) {
            return InvalidationOutcome::Ignored;
        }
        match message.kind {
            InvalidationKind::Key => self.apply_key(message),
            InvalidationKind::Cache => {
                let Some(cache_name) = message.cache_name.as_deref() else {
                    tracing::warn!(origin = %message.origin_node_id, "CACHE invalidation without cache name");
                    return InvalidationOutcome::Ignored;
                };
                if let Some(tier) = self.locals.existing(cache_name) {
                    tier.clear();
                }
                self.metrics
                    .record(cache_name, CacheEvent::InvalidationApplied);
                tracing::debug!(cache = %cache_name, origin = %message.origin_node_id, "cleared local cache on peer request");
                InvalidationOutcome::Applied
            }
            InvalidationKind::All => {
                self.locals.clear_all();
                for cache_name in self.locals.cache_names() {
                    self.metrics
                        .record(&cache_name, CacheEvent::InvalidationApplied);
                }
                tracing::debug!(origin = %message.origin_node_id, "cleared all local caches on peer request");
                InvalidationOutcome::Applied
            }
        }
    }

    fn apply_key(&self, message: &InvalidationMessage) -> InvalidationOutcome {
        let (Some(cache_name), Some(token)) = (message.cache_name.as_deref(), message.key.as_deref())
        else {
            tracing::warn!(origin = %message.origin_node_id, "KEY invalidation without cache name or key");
            return InvalidationOutcome::Ignored;
        };
        let resolved =
            match self
                .serializer
                .resolve_token(message.tenant_id.as_deref(), cache_name, token)
            {
                Ok(resolved) => resolved,
                Err(e) => {
                    tracing::warn!(cache = %cache_name, error = %e, "malformed KEY invalidation");
                    return InvalidationOutcome::Ignored;
                }
            };

        self.learn(cache_name, &resolved.full);

        let Some(tier) = self.locals.existing(cache_name) else {
            self.metrics
                .record(cache_name, CacheEvent::InvalidationApplied);
            return InvalidationOutcome::Applied;
        };

        if let Some(incoming) = message.version {
            let local_version = tier.get(&resolved.full).and_then(|entry| entry.version);
            if let Some(local) = local_version.filter(|local| incoming <= *local) {
                self.metrics
                    .record(cache_name, CacheEvent::InvalidationSkipped);
                tracing::debug!(
                    cache = %cache_name,
                    key = %resolved.full,
                    incoming,
                    local,
                    "kept newer local entry"
                );
                return InvalidationOutcome::Skipped;
            }
        }

        tier.delete(&resolved.full);
        self.metrics
            .record(cache_name, CacheEvent::InvalidationApplied);
        tracing::debug!(cache = %cache_name, key = %resolved.full, origin = %message.origin_node_id, "dropped local entry on peer request");
        InvalidationOutcome::Applied
    }

    /// A peer wrote or deleted the key, so it may exist in the shared tier.
    fn learn(&self, cache_name: &str, full_key: &str) {
        let Some(filter) = &self.filter else {
            return;
        };
        let enabled = self
            .specs
            .resolve(cache_name)
            .map(|spec| spec.bloom_enabled())
            .unwrap_or(false);
        if enabled {
            // Detached: the insertion completes on its own task.
            drop(filter.put_async(cache_name, full_key));
        }
    }
}

impl InvalidationHandler for InvalidationApplier {
    fn handle(&self, message: InvalidationMessage) {
        self.apply(&message);
    }
}
