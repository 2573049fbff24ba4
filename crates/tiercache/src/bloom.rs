//! Bloom-filter membership per cache-name.
//!
//! Filters are created lazily on the first insertion into a cache-name and
//! grow in generations: once the newest generation has taken 90% of its
//! expected insertions a new generation with twice the capacity is added.
//! Older generations stay readable, so a key inserted before a resize is
//! still reported present.
//!
//! A filter only knows keys recorded by this process, so after a restart it
//! answers [`Membership::Unknown`] until it is trustworthy: either
//! [`MembershipFilter::mark_complete`] was called (see
//! `TieredCache::warm_filter`), or the filter has existed for the
//! cache-name's remote TTL, by which time every entry written before it was
//! created has expired.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tiercache_core::{Membership, MembershipFilter, SpecRegistry};
use tokio::time::Instant;

use crate::metrics::{CacheEvent, MetricsRegistry};

/// Fraction of expected insertions after which a filter grows.
pub const RESIZE_THRESHOLD: f64 = 0.9;

const LN2_SQUARED: f64 = std::f64::consts::LN_2 * std::f64::consts::LN_2;

/// A fixed-size bloom filter with lock-free inserts.
#[derive(Debug)]
pub struct BloomFilter {
    bits: Box<[AtomicU64]>,
    num_bits: u64,
    num_hashes: u32,
    expected_insertions: u64,
    false_positive_rate: f64,
    insertions: AtomicU64,
}

impl BloomFilter {
    /// Sizes the filter for `expected_insertions` at `false_positive_rate`.
    pub fn new(expected_insertions: u64, false_positive_rate: f64) -> Self {
        let n = expected_insertions.max(1) as f64;
        let p = false_positive_rate.clamp(f64::MIN_POSITIVE, 0.999);
        let num_bits = ((-n * p.ln()) / LN2_SQUARED).ceil().max(64.0) as u64;
        let num_hashes = ((num_bits as f64 / n) * std::f64::consts::LN_2)
            .round()
            .clamp(1.0, 30.0) as u32;
        let words = num_bits.div_ceil(64) as usize;

        Self {
            bits: (0..words).map(|_| AtomicU64::new(0)).collect(),
            num_bits,
            num_hashes,
            expected_insertions: expected_insertions.max(1),
            false_positive_rate,
            insertions: AtomicU64::new(0),
        }
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    pub fn expected_insertions(&self) -> u64 {
        self.expected_insertions
    }

    /// Insertions that set at least one new bit.
    pub fn approximate_insertions(&self) -> u64 {
        self.insertions.load(Ordering::Relaxed)
    }

    fn is_saturated(&self) -> bool {
        self.approximate_insertions() as f64 >= self.expected_insertions as f64 * RESIZE_THRESHOLD
    }

    /// Inserts an item. Returns `true` if the item was not already present.
    pub fn insert(&self, item: &[u8]) -> bool {
        let mut changed = false;
        for bit in self.bit_positions(item) {
            let mask = 1u64 << (bit % 64);
            let previous = self.bits[(bit / 64) as usize].fetch_or(mask, Ordering::Relaxed);
            changed |= previous & mask == 0;
        }
        if changed {
            self.insertions.fetch_add(1, Ordering::Relaxed);
        }
        changed
    }

    pub fn might_contain(&self, item: &[u8]) -> bool {
        self.bit_positions(item).all(|bit| {
            let mask = 1u64 << (bit % 64);
            self.bits[(bit / 64) as usize].load(Ordering::Relaxed) & mask != 0
        })
    }

    /// Kirsch-Mitzenmacher double hashing.
    fn bit_positions(&self, item: &[u8]) -> impl Iterator<Item = u64> + use<> {
        let h1 = hash_with_seed(item, 0x51_7c_c1_b7_27_22_0a_95);
        let h2 = hash_with_seed(item, 0x9e_37_79_b9_7f_4a_7c_15) | 1;
        let num_bits = self.num_bits;
        (0..u64::from(self.num_hashes))
            .map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % num_bits)
    }
}

fn hash_with_seed(item: &[u8], seed: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    item.hash(&mut hasher);
    hasher.finish()
}

struct FilterSlot {
    generations: ArcSwap<Vec<Arc<BloomFilter>>>,
    grow_lock: Mutex<()>,
    trusted_from: Option<Instant>,
    complete: AtomicBool,
}

impl FilterSlot {
    fn new(first: BloomFilter, warm_up: Duration) -> Self {
        Self {
            generations: ArcSwap::from_pointee(vec![Arc::new(first)]),
            grow_lock: Mutex::new(()),
            trusted_from: Instant::now().checked_add(warm_up),
            complete: AtomicBool::new(false),
        }
    }

    fn is_trusted(&self) -> bool {
        self.complete.load(Ordering::Acquire)
            || self.trusted_from.is_some_and(|from| Instant::now() >= from)
    }

    fn might_contain(&self, item: &[u8]) -> bool {
        self.generations
            .load()
            .iter()
            .any(|filter| filter.might_contain(item))
    }

    /// Inserts into the newest generation. Returns `true` if a generation was added.
    fn insert(&self, item: &[u8]) -> bool {
        let generations = self.generations.load_full();
        let Some(newest) = generations.last() else {
            return false;
        };
        newest.insert(item);
        if !newest.is_saturated() {
            return false;
        }

        let _grow = self.grow_lock.lock();
        let current = self.generations.load_full();
        let Some(newest) = current.last() else {
            return false;
        };
        if !newest.is_saturated() {
            return false;
        }
        let mut grown: Vec<Arc<BloomFilter>> = current.iter().cloned().collect();
        grown.push(Arc::new(BloomFilter::new(
            newest.expected_insertions().saturating_mul(2),
            newest.false_positive_rate,
        )));
        self.generations.store(Arc::new(grown));
        true
    }

    fn total_capacity(&self) -> u64 {
        self.generations
            .load()
            .iter()
            .map(|filter| filter.expected_insertions())
            .sum()
    }
}

struct Inner {
    specs: Arc<SpecRegistry>,
    metrics: Arc<MetricsRegistry>,
    filters: DashMap<String, Arc<FilterSlot>>,
}

impl Inner {
    fn slot(&self, cache_name: &str) -> Option<Arc<FilterSlot>> {
        if let Some(slot) = self.filters.get(cache_name) {
            return Some(slot.value().clone());
        }
        let spec = match self.specs.resolve(cache_name) {
            Ok(spec) => spec,
            Err(e) => {
                tracing::warn!(cache = %cache_name, error = %e, "bloom filter not created");
                return None;
            }
        };
        let slot = self
            .filters
            .entry(cache_name.to_string())
            .or_insert_with(|| {
                tracing::debug!(
                    cache = %cache_name,
                    expected_insertions = spec.bloom_expected_insertions(),
                    fpp = spec.bloom_false_positive_rate(),
                    "creating bloom filter"
                );
                Arc::new(FilterSlot::new(
                    BloomFilter::new(
                        spec.bloom_expected_insertions(),
                        spec.bloom_false_positive_rate(),
                    ),
                    spec.ttl_remote(),
                ))
            })
            .value()
            .clone();
        Some(slot)
    }

    fn insert(&self, cache_name: &str, key: &str) {
        let Some(slot) = self.slot(cache_name) else {
            return;
        };
        if slot.insert(key.as_bytes()) {
            self.metrics.record(cache_name, CacheEvent::FilterResize);
            tracing::warn!(
                cache = %cache_name,
                capacity = slot.total_capacity(),
                "bloom filter reached its threshold, added a larger generation"
            );
        }
    }
}

/// [`MembershipFilter`] backed by one generational bloom filter per cache-name.
#[derive(Clone)]
pub struct BloomMembershipFilter {
    inner: Arc<Inner>,
}

impl BloomMembershipFilter {
    pub fn new(specs: Arc<SpecRegistry>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            inner: Arc::new(Inner {
                specs,
                metrics,
                filters: DashMap::new(),
            }),
        }
    }

    /// Synchronous insertion, used when no runtime is available.
    pub fn put(&self, cache_name: &str, key: &str) {
        self.inner.insert(cache_name, key);
    }

    /// Number of generations of a cache-name's filter, if created.
    pub fn generations(&self, cache_name: &str) -> Option<usize> {
        self.inner
            .filters
            .get(cache_name)
            .map(|slot| slot.generations.load().len())
    }
}

impl MembershipFilter for BloomMembershipFilter {
    fn might_contain(&self, cache_name: &str, key: &str) -> bool {
        self.check(cache_name, key) != Membership::Absent
    }

    fn check(&self, cache_name: &str, key: &str) -> Membership {
        match self.inner.filters.get(cache_name) {
            Some(slot) if slot.is_trusted() => {
                if slot.might_contain(key.as_bytes()) {
                    Membership::Maybe
                } else {
                    Membership::Absent
                }
            }
            _ => Membership::Unknown,
        }
    }

    fn mark_complete(&self, cache_name: &str) {
        if let Some(slot) = self.inner.slot(cache_name) {
            slot.complete.store(true, Ordering::Release);
            tracing::debug!(cache = %cache_name, "bloom filter marked complete");
        }
    }

    fn put_async(&self, cache_name: &str, key: &str) -> BoxFuture<'static, ()> {
        let inner = self.inner.clone();
        let cache_name = cache_name.to_string();
        let key = key.to_string();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let task = handle.spawn(async move { inner.insert(&cache_name, &key) });
                async move {
                    if let Err(e) = task.await {
                        tracing::warn!(error = %e, "bloom filter insertion task failed");
                    }
                }
                .boxed()
            }
            Err(_) => {
                inner.insert(&cache_name, &key);
                futures_util::future::ready(()).boxed()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiercache_core::CacheSpecification;

    fn filter_with(expected: u64, fpp: f64) -> (BloomMembershipFilter, Arc<MetricsRegistry>) {
        let specs = Arc::new(SpecRegistry::default());
        specs
            .register(
                "orders",
                CacheSpecification::builder()
                    .bloom_enabled(true)
                    .bloom_expected_insertions(expected)
                    .bloom_false_positive_rate(fpp)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let metrics = Arc::new(MetricsRegistry::new());
        (BloomMembershipFilter::new(specs, metrics.clone()), metrics)
    }

    #[test]
    fn test_sizing() {
        let filter = BloomFilter::new(10_000, 0.01);
        // ~9.6 bits per element and 7 hashes for 1%.
        assert!((95_000..=96_000).contains(&filter.num_bits()));
        assert_eq!(filter.num_hashes(), 7);
    }

    #[test]
    fn test_no_false_negatives() {
        let filter = BloomFilter::new(1_000, 0.01);
        for i in 0..1_000 {
            filter.insert(format!("key-{i}").as_bytes());
        }
        for i in 0..1_000 {
            assert!(filter.might_contain(format!("key-{i}").as_bytes()));
        }
    }

    #[test]
    fn test_false_positive_rate_is_bounded() {
        let filter = BloomFilter::new(1_000, 0.01);
        for i in 0..1_000 {
            filter.insert(format!("present-{i}").as_bytes());
        }
        let false_positives = (0..10_000)
            .filter(|i| filter.might_contain(format!("absent-{i}").as_bytes()))
            .count();
        assert!(false_positives < 300, "false positives: {false_positives}");
    }

    #[tokio::test]
    async fn test_unknown_cache_name_fails_open() {
        let (filter, _) = filter_with(100, 0.01);
        assert!(filter.might_contain("orders", "anything"));
        assert!(filter.might_contain("never-used", "anything"));
    }

    #[tokio::test]
    async fn test_put_async_then_might_contain() {
        let (filter, _) = filter_with(100, 0.01);
        filter.put_async("orders", "tc:app:default:orders:1").await;
        filter.mark_complete("orders");
        assert!(filter.might_contain("orders", "tc:app:default:orders:1"));
        assert_eq!(filter.check("orders", "tc:app:default:orders:1"), Membership::Maybe);
        assert_eq!(filter.generations("orders"), Some(1));
    }

    #[tokio::test]
    async fn test_untrusted_until_marked_complete() {
        let (filter, _) = filter_with(100, 0.01);
        filter.put_async("orders", "k1").await;
        // Keys written before this filter existed may still be in L2.
        assert_eq!(filter.check("orders", "older"), Membership::Unknown);
        assert!(filter.might_contain("orders", "older"));

        filter.mark_complete("orders");
        assert_eq!(filter.check("orders", "older"), Membership::Absent);
        assert!(!filter.might_contain("orders", "older"));
    }

    #[tokio::test]
    async fn test_mark_complete_on_empty_cache_name() {
        let (filter, _) = filter_with(100, 0.01);
        filter.mark_complete("orders");
        assert_eq!(filter.check("orders", "k"), Membership::Absent);
        assert_eq!(filter.generations("orders"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trusted_once_remote_ttl_has_passed() {
        let (filter, _) = filter_with(100, 0.01);
        filter.put_async("orders", "k1").await;
        assert_eq!(filter.check("orders", "older"), Membership::Unknown);

        // Default remote TTL is one day.
        tokio::time::advance(Duration::from_secs(24 * 3600)).await;
        assert_eq!(filter.check("orders", "older"), Membership::Absent);
        assert_eq!(filter.check("orders", "k1"), Membership::Maybe);
    }

    #[tokio::test]
    async fn test_resize_keeps_earlier_keys() {
        let (filter, metrics) = filter_with(100, 0.01);
        for i in 0..500 {
            filter.put_async("orders", &format!("k{i}")).await;
        }
        assert!(filter.generations("orders").unwrap() >= 2);
        assert!(metrics.snapshot("orders").filter_resizes >= 1);
        for i in 0..500 {
            assert!(filter.might_contain("orders", &format!("k{i}")), "k{i} lost");
        }
    }

    #[test]
    fn test_put_without_runtime() {
        let (filter, _) = filter_with(100, 0.01);
        // Inserted inline; the returned future is already complete.
        drop(filter.put_async("orders", "k"));
        filter.mark_complete("orders");
        assert!(filter.might_contain("orders", "k"));
        assert!(!filter.might_contain("orders", "other"));
    }
}
