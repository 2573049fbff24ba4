//! Cache metrics.
//!
//! This module provides:
//! - [`MetricsRegistry`]: owned per cache-name counters with immutable
//!   snapshots and an all-or-nothing reset
//! - mirroring of every increment to the `metrics` facade
//! - optional Prometheus exporter installation

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    pub const L1_HITS_TOTAL: &str = "tiercache_l1_hits_total";
    pub const L2_HITS_TOTAL: &str = "tiercache_l2_hits_total";
    pub const MISSES_TOTAL: &str = "tiercache_misses_total";
    pub const FILTER_SHORT_CIRCUITS_TOTAL: &str = "tiercache_filter_short_circuits_total";
    pub const FILTER_MAYBE_TOTAL: &str = "tiercache_filter_maybe_total";
    pub const FILTER_FALSE_POSITIVES_TOTAL: &str = "tiercache_filter_false_positives_total";
    pub const FILTER_RESIZES_TOTAL: &str = "tiercache_filter_resizes_total";
    pub const BACKFILL_SUCCESSES_TOTAL: &str = "tiercache_backfill_successes_total";
    pub const BACKFILL_FAILURES_TOTAL: &str = "tiercache_backfill_failures_total";
    pub const REMOTE_ERRORS_TOTAL: &str = "tiercache_remote_errors_total";
    pub const EVICTIONS_TOTAL: &str = "tiercache_evictions_total";
    pub const INVALIDATIONS_APPLIED_TOTAL: &str = "tiercache_invalidations_applied_total";
    pub const INVALIDATIONS_SKIPPED_TOTAL: &str = "tiercache_invalidations_skipped_total";
    pub const BROADCAST_FAILURES_TOTAL: &str = "tiercache_broadcast_failures_total";
}

/// Install the Prometheus recorder for the `metrics` facade.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }
            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

/// Events counted per cache-name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    L1Hit,
    L2Hit,
    Miss,
    /// The filter answered "definitely absent" and L2 was skipped.
    FilterShortCircuit,
    /// The filter answered "maybe present".
    FilterMaybe,
    /// A "maybe present" key turned out absent in L2.
    FilterFalsePositive,
    FilterResize,
    BackfillSuccess,
    BackfillFailure,
    /// A remote read failed and was degraded to a miss.
    RemoteError,
    Eviction,
    InvalidationApplied,
    /// A versioned invalidation older than the local entry.
    InvalidationSkipped,
    BroadcastFailure,
}

impl CacheEvent {
    fn metric_name(self) -> &'static str {
        match self {
            Self::L1Hit => names::L1_HITS_TOTAL,
            Self::L2Hit => names::L2_HITS_TOTAL,
            Self::Miss => names::MISSES_TOTAL,
            Self::FilterShortCircuit => names::FILTER_SHORT_CIRCUITS_TOTAL,
            Self::FilterMaybe => names::FILTER_MAYBE_TOTAL,
            Self::FilterFalsePositive => names::FILTER_FALSE_POSITIVES_TOTAL,
            Self::FilterResize => names::FILTER_RESIZES_TOTAL,
            Self::BackfillSuccess => names::BACKFILL_SUCCESSES_TOTAL,
            Self::BackfillFailure => names::BACKFILL_FAILURES_TOTAL,
            Self::RemoteError => names::REMOTE_ERRORS_TOTAL,
            Self::Eviction => names::EVICTIONS_TOTAL,
            Self::InvalidationApplied => names::INVALIDATIONS_APPLIED_TOTAL,
            Self::InvalidationSkipped => names::INVALIDATIONS_SKIPPED_TOTAL,
            Self::BroadcastFailure => names::BROADCAST_FAILURES_TOTAL,
        }
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    filter_short_circuits: AtomicU64,
    filter_maybe: AtomicU64,
    filter_false_positives: AtomicU64,
    filter_resizes: AtomicU64,
    backfill_successes: AtomicU64,
    backfill_failures: AtomicU64,
    remote_errors: AtomicU64,
    evictions: AtomicU64,
    invalidations_applied: AtomicU64,
    invalidations_skipped: AtomicU64,
    broadcast_failures: AtomicU64,
}

impl CacheCounters {
    fn slot(&self, event: CacheEvent) -> &AtomicU64 {
        match event {
            CacheEvent::L1Hit => &self.l1_hits,
            CacheEvent::L2Hit => &self.l2_hits,
            CacheEvent::Miss => &self.misses,
            CacheEvent::FilterShortCircuit => &self.filter_short_circuits,
            CacheEvent::FilterMaybe => &self.filter_maybe,
            CacheEvent::FilterFalsePositive => &self.filter_false_positives,
            CacheEvent::FilterResize => &self.filter_resizes,
            CacheEvent::BackfillSuccess => &self.backfill_successes,
            CacheEvent::BackfillFailure => &self.backfill_failures,
            CacheEvent::RemoteError => &self.remote_errors,
            CacheEvent::Eviction => &self.evictions,
            CacheEvent::InvalidationApplied => &self.invalidations_applied,
            CacheEvent::InvalidationSkipped => &self.invalidations_skipped,
            CacheEvent::BroadcastFailure => &self.broadcast_failures,
        }
    }

    fn snapshot(&self) -> CacheMetricsSnapshot {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CacheMetricsSnapshot {
            l1_hits: read(&self.l1_hits),
            l2_hits: read(&self.l2_hits),
            misses: read(&self.misses),
            filter_short_circuits: read(&self.filter_short_circuits),
            filter_maybe: read(&self.filter_maybe),
            filter_false_positives: read(&self.filter_false_positives),
            filter_resizes: read(&self.filter_resizes),
            backfill_successes: read(&self.backfill_successes),
            backfill_failures: read(&self.backfill_failures),
            remote_errors: read(&self.remote_errors),
            evictions: read(&self.evictions),
            invalidations_applied: read(&self.invalidations_applied),
            invalidations_skipped: read(&self.invalidations_skipped),
            broadcast_failures: read(&self.broadcast_failures),
        }
    }
}

/// Point-in-time copy of one cache-name's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetricsSnapshot {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub filter_short_circuits: u64,
    pub filter_maybe: u64,
    pub filter_false_positives: u64,
    pub filter_resizes: u64,
    pub backfill_successes: u64,
    pub backfill_failures: u64,
    pub remote_errors: u64,
    pub evictions: u64,
    pub invalidations_applied: u64,
    pub invalidations_skipped: u64,
    pub broadcast_failures: u64,
}

impl CacheMetricsSnapshot {
    /// Lookups answered by a tier, plus misses and short-circuits.
    pub fn total_requests(&self) -> u64 {
        self.l1_hits + self.l2_hits + self.misses + self.filter_short_circuits
    }

    /// Fraction of lookups served by either tier.
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            (self.l1_hits + self.l2_hits) as f64 / total as f64
        }
    }

    /// Fraction of "maybe present" filter answers that L2 contradicted.
    pub fn false_positive_rate(&self) -> f64 {
        if self.filter_maybe == 0 {
            0.0
        } else {
            self.filter_false_positives as f64 / self.filter_maybe as f64
        }
    }

    /// Fraction of backfills that were admitted to L1; 1.0 when none ran.
    pub fn backfill_success_rate(&self) -> f64 {
        let total = self.backfill_successes + self.backfill_failures;
        if total == 0 {
            1.0
        } else {
            self.backfill_successes as f64 / total as f64
        }
    }
}

type CounterMap = DashMap<String, Arc<CacheCounters>>;

/// Owned counters for every cache-name of one engine instance.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    caches: ArcSwap<CounterMap>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one event for `cache_name`.
    pub fn record(&self, cache_name: &str, event: CacheEvent) {
        let caches = self.caches.load();
        let counters = match caches.get(cache_name) {
            Some(counters) => counters.value().clone(),
            None => caches
                .entry(cache_name.to_string())
                .or_default()
                .value()
                .clone(),
        };
        counters.slot(event).fetch_add(1, Ordering::Relaxed);
        counter!(event.metric_name(), "cache" => cache_name.to_string()).increment(1);
    }

    /// Snapshot of one cache-name; zeros if nothing was recorded.
    pub fn snapshot(&self, cache_name: &str) -> CacheMetricsSnapshot {
        self.caches
            .load()
            .get(cache_name)
            .map(|counters| counters.snapshot())
            .unwrap_or_default()
    }

    /// Snapshots of every cache-name seen so far.
    pub fn snapshot_all(&self) -> BTreeMap<String, CacheMetricsSnapshot> {
        self.caches
            .load()
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    /// Resets every counter of every cache-name at once.
    pub fn reset(&self) {
        self.caches.store(Arc::new(CounterMap::new()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let registry = MetricsRegistry::new();
        registry.record("orders", CacheEvent::L1Hit);
        registry.record("orders", CacheEvent::L1Hit);
        registry.record("orders", CacheEvent::L2Hit);
        registry.record("orders", CacheEvent::Miss);
        registry.record("users", CacheEvent::Miss);

        let orders = registry.snapshot("orders");
        assert_eq!(orders.l1_hits, 2);
        assert_eq!(orders.l2_hits, 1);
        assert_eq!(orders.misses, 1);
        assert!((orders.hit_rate() - 0.75).abs() < 1e-9);
        assert_eq!(registry.snapshot("users").misses, 1);
        assert_eq!(registry.snapshot("unknown"), CacheMetricsSnapshot::default());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let registry = MetricsRegistry::new();
        registry.record("orders", CacheEvent::Eviction);
        let before = registry.snapshot("orders");
        registry.record("orders", CacheEvent::Eviction);
        assert_eq!(before.evictions, 1);
        assert_eq!(registry.snapshot("orders").evictions, 2);
    }

    #[test]
    fn test_derived_rates() {
        let snapshot = CacheMetricsSnapshot {
            filter_maybe: 10,
            filter_false_positives: 1,
            backfill_successes: 3,
            backfill_failures: 1,
            ..Default::default()
        };
        assert!((snapshot.false_positive_rate() - 0.1).abs() < 1e-9);
        assert!((snapshot.backfill_success_rate() - 0.75).abs() < 1e-9);

        let empty = CacheMetricsSnapshot::default();
        assert_eq!(empty.hit_rate(), 0.0);
        assert_eq!(empty.false_positive_rate(), 0.0);
        assert_eq!(empty.backfill_success_rate(), 1.0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let registry = MetricsRegistry::new();
        registry.record("orders", CacheEvent::L1Hit);
        registry.record("users", CacheEvent::FilterResize);
        registry.reset();
        assert!(registry.snapshot_all().is_empty());
        assert_eq!(registry.snapshot("orders").l1_hits, 0);
    }
}
