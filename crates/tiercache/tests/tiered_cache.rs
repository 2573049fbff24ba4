//! Multi-node behavior of the engine over the in-memory tier and bus.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tiercache::{
    CacheEntry, CacheSpecification, InMemoryInvalidationBus, InMemoryRemoteTier,
    InvalidationKind, TieredCache, with_tenant,
};
use tiercache_core::{CacheResult, RemoteTier};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u64,
    item: String,
    quantity: u32,
}

fn order(id: u64) -> Order {
    Order {
        id,
        item: format!("item-{id}"),
        quantity: 1,
    }
}

struct Cluster {
    remote: InMemoryRemoteTier,
    bus: Arc<InMemoryInvalidationBus>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            remote: InMemoryRemoteTier::new(),
            bus: InMemoryInvalidationBus::new(),
        }
    }

    async fn node(&self, node_id: &str) -> TieredCache {
        TieredCache::builder()
            .with_node_id(node_id)
            .with_key_prefix("tc")
            .with_application_name("orderService")
            .with_remote(Arc::new(self.remote.clone()))
            .with_channel(self.bus.connect(node_id))
            .with_cache(
                "users",
                CacheSpecification::builder()
                    .bloom_enabled(true)
                    .bloom_expected_insertions(1_000)
                    .build()
                    .unwrap(),
            )
            .unwrap()
            .build()
            .await
            .unwrap()
    }
}

/// Lets detached filter insertions run.
async fn settle() {
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test]
async fn test_orders_scenario_end_to_end() {
    let cluster = Cluster::new();
    let node_a = cluster.node("node-a").await;
    let node_b = cluster.node("node-b").await;

    node_a.put("orders", &42_u64, &order(42), None).await.unwrap();

    let full = node_a.serializer().build_key("orders", &42_u64).unwrap();
    assert_eq!(full, "tc:order_service:default:orders:42");

    let remote_ttl = cluster.remote.ttl_of(&full).unwrap();
    assert!(remote_ttl > Duration::from_secs(24 * 3600 - 60));
    assert!(remote_ttl <= Duration::from_secs(24 * 3600));

    let local = node_a.local_tier("orders").unwrap().get(&full).unwrap();
    assert_eq!(local.ttl, Duration::from_secs(69_120));

    node_b.evict("orders", &42_u64).await.unwrap();

    let last = cluster.bus.published().pop().unwrap();
    assert_eq!(last.kind, InvalidationKind::Key);
    assert_eq!(last.cache_name.as_deref(), Some("orders"));
    assert_eq!(last.key.as_deref(), Some("42"));
    assert_eq!(last.version, None);
    assert_eq!(last.origin_node_id, "node-b");

    assert!(node_a.local_tier("orders").unwrap().get(&full).is_none());
    assert_eq!(node_a.metrics_snapshot("orders").invalidations_applied, 1);
    assert!(cluster.remote.ttl_of(&full).is_none());
}

#[tokio::test]
async fn test_read_after_write_hits_l1() {
    let cluster = Cluster::new();
    let node = cluster.node("node-a").await;

    node.put("orders", &1_u64, &order(1), None).await.unwrap();
    let read: Option<Order> = node.get("orders", &1_u64).await.unwrap();
    assert_eq!(read, Some(order(1)));

    let snapshot = node.metrics_snapshot("orders");
    assert_eq!(snapshot.l1_hits, 1);
    assert_eq!(snapshot.l2_hits, 0);
}

#[tokio::test]
async fn test_backfill_after_local_eviction() {
    let cluster = Cluster::new();
    let node = cluster.node("node-a").await;
    let full = node.serializer().build_key("orders", &7_u64).unwrap();

    node.put("orders", &7_u64, &order(7), None).await.unwrap();
    assert!(node.local_tier("orders").unwrap().delete(&full));

    let read: Option<Order> = node.get("orders", &7_u64).await.unwrap();
    assert_eq!(read, Some(order(7)));

    let backfilled = node.local_tier("orders").unwrap().get(&full).unwrap();
    assert!(backfilled.ttl <= Duration::from_secs(24 * 3600));
    let snapshot = node.metrics_snapshot("orders");
    assert_eq!(snapshot.l2_hits, 1);
    assert_eq!(snapshot.backfill_successes, 1);

    let again: Option<Order> = node.get("orders", &7_u64).await.unwrap();
    assert_eq!(again, Some(order(7)));
    assert_eq!(node.metrics_snapshot("orders").l1_hits, 1);
}

#[tokio::test]
async fn test_peer_sees_write_through_shared_tier() {
    let cluster = Cluster::new();
    let node_a = cluster.node("node-a").await;
    let node_b = cluster.node("node-b").await;

    node_a.put("orders", "a-1", &order(1), None).await.unwrap();
    let read: Option<Order> = node_b.get("orders", "a-1").await.unwrap();
    assert_eq!(read, Some(order(1)));
    assert_eq!(node_b.metrics_snapshot("orders").l2_hits, 1);

    // A newer write on A drops B's stale local copy.
    let mut updated = order(1);
    updated.quantity = 5;
    node_a.put("orders", "a-1", &updated, None).await.unwrap();
    let read: Option<Order> = node_b.get("orders", "a-1").await.unwrap();
    assert_eq!(read, Some(updated));
}

#[tokio::test]
async fn test_version_guard_across_nodes() {
    let cluster = Cluster::new();
    let node_a = cluster.node("node-a").await;
    let node_b = cluster.node("node-b").await;
    let full = node_a.serializer().build_key("orders", "v").unwrap();

    node_a
        .put_versioned("orders", "v", &order(7), 7, None)
        .await
        .unwrap();

    node_b
        .put_versioned("orders", "v", &order(5), 5, None)
        .await
        .unwrap();
    let kept = node_a.local_tier("orders").unwrap().get(&full).unwrap();
    assert_eq!(kept.version, Some(7));
    assert_eq!(node_a.metrics_snapshot("orders").invalidations_skipped, 1);

    node_b
        .put_versioned("orders", "v", &order(9), 9, None)
        .await
        .unwrap();
    assert!(node_a.local_tier("orders").unwrap().get(&full).is_none());

    let entry: CacheEntry<Order> = node_a.get_entry("orders", "v").await.unwrap().unwrap();
    assert_eq!(entry.version, Some(9));
    assert_eq!(entry.value, order(9));
}

#[tokio::test]
async fn test_filter_short_circuits_unknown_keys() {
    let cluster = Cluster::new();
    let node = cluster.node("node-a").await;
    // A fresh L2: nothing to record.
    node.warm_filter::<&str>("users", &[]).await.unwrap();

    node.put("users", "alice", &"Alice", None).await.unwrap();
    settle().await;
    let missing: Option<String> = node.get("users", "bob").await.unwrap();
    assert_eq!(missing, None);

    let snapshot = node.metrics_snapshot("users");
    assert_eq!(snapshot.filter_short_circuits, 1);
    assert_eq!(snapshot.l2_hits, 0);
}

#[tokio::test]
async fn test_filter_fails_open_before_first_insert() {
    let cluster = Cluster::new();
    let node = cluster.node("node-a").await;

    // Written behind the engine's back: the filter has never seen "users".
    let full = node.serializer().build_key("users", "carol").unwrap();
    let bytes = CacheEntry::new("Carol").encode().unwrap();
    cluster
        .remote
        .put(&full, &bytes, Duration::from_secs(60))
        .await
        .unwrap();

    let read: Option<String> = node.get("users", "carol").await.unwrap();
    assert_eq!(read.as_deref(), Some("Carol"));

    // The filter gave no answer, so nothing is counted against it.
    let missing: Option<String> = node.get("users", "nobody").await.unwrap();
    assert_eq!(missing, None);
    let snapshot = node.metrics_snapshot("users");
    assert_eq!(snapshot.filter_maybe, 0);
    assert_eq!(snapshot.filter_false_positives, 0);
    assert_eq!(snapshot.false_positive_rate(), 0.0);
}

#[tokio::test]
async fn test_restarted_node_still_reads_older_entries() {
    let cluster = Cluster::new();
    let old = cluster.node("node-old").await;
    old.put("users", "alice", &"Alice", None).await.unwrap();
    old.shutdown().await;

    let fresh = cluster.node("node-fresh").await;
    fresh.put("users", "bob", &"Bob", None).await.unwrap();
    settle().await;

    let read: Option<String> = fresh.get("users", "alice").await.unwrap();
    assert_eq!(read.as_deref(), Some("Alice"));
    let snapshot = fresh.metrics_snapshot("users");
    assert_eq!(snapshot.filter_short_circuits, 0);
    assert_eq!(snapshot.l2_hits, 1);
}

#[tokio::test]
async fn test_filter_has_no_false_negatives_for_peer_writes() {
    let cluster = Cluster::new();
    let node_a = cluster.node("node-a").await;
    let node_b = cluster.node("node-b").await;

    node_a.put("users", "alice", &"Alice", None).await.unwrap();
    node_b.put("users", "dave", &"Dave", None).await.unwrap();
    settle().await;

    let read: Option<String> = node_a.get("users", "dave").await.unwrap();
    assert_eq!(read.as_deref(), Some("Dave"));

    for i in 0..200 {
        node_a
            .put("users", &format!("user-{i}"), &i, None)
            .await
            .unwrap();
    }
    for i in 0..200 {
        let full = node_a
            .serializer()
            .build_key("users", &format!("user-{i}"))
            .unwrap();
        node_a.local_tier("users").unwrap().delete(&full);
        let read: Option<i32> = node_a.get("users", &format!("user-{i}")).await.unwrap();
        assert_eq!(read, Some(i));
    }
}

#[tokio::test]
async fn test_warm_filter_makes_existing_keys_reachable() {
    let cluster = Cluster::new();
    let node = cluster.node("node-a").await;
    node.put("users", "alice", &"Alice", None).await.unwrap();

    let full = node.serializer().build_key("users", "erin").unwrap();
    let bytes = CacheEntry::new("Erin").encode().unwrap();
    cluster
        .remote
        .put(&full, &bytes, Duration::from_secs(60))
        .await
        .unwrap();

    let alice = node.serializer().build_key("users", "alice").unwrap();
    node.local_tier("users").unwrap().delete(&alice);

    node.warm_filter("users", &["alice", "erin"]).await.unwrap();
    let read: Option<String> = node.get("users", "erin").await.unwrap();
    assert_eq!(read.as_deref(), Some("Erin"));
    let read: Option<String> = node.get("users", "alice").await.unwrap();
    assert_eq!(read.as_deref(), Some("Alice"));

    let missing: Option<String> = node.get("users", "nobody").await.unwrap();
    assert_eq!(missing, None);
    assert_eq!(node.metrics_snapshot("users").filter_short_circuits, 1);
}

#[tokio::test]
async fn test_remote_outage_degrades_reads_and_fails_writes() {
    let cluster = Cluster::new();
    let node = cluster.node("node-a").await;

    cluster.remote.set_available(false);

    let read: Option<Order> = node.get("orders", &1_u64).await.unwrap();
    assert_eq!(read, None);
    let snapshot = node.metrics_snapshot("orders");
    assert_eq!(snapshot.remote_errors, 1);
    assert_eq!(snapshot.misses, 1);

    let err = node.put("orders", &1_u64, &order(1), None).await.err().unwrap();
    assert!(err.is_tier_unavailable());
    // A failed remote write never reaches L1.
    let full = node.serializer().build_key("orders", &1_u64).unwrap();
    assert!(node.local_tier("orders").unwrap().get(&full).is_none());

    let err = node.evict("orders", &1_u64).await.err().unwrap();
    assert!(err.is_tier_unavailable());
    // Peers were told anyway.
    assert_eq!(cluster.bus.published().len(), 1);
}

#[tokio::test]
async fn test_get_or_load_survives_remote_outage() {
    let cluster = Cluster::new();
    let node = cluster.node("node-a").await;
    cluster.remote.set_available(false);

    let value = node
        .get_or_load("orders", &3_u64, None, || async { Ok::<_, anyhow::Error>(order(3)) })
        .await
        .unwrap();
    assert_eq!(value, order(3));

    // Kept locally while the remote tier is down.
    let read: Option<Order> = node.get("orders", &3_u64).await.unwrap();
    assert_eq!(read, Some(order(3)));
}

#[tokio::test]
async fn test_get_or_load_runs_loader_once_across_nodes() {
    let cluster = Cluster::new();
    let nodes = [
        Arc::new(cluster.node("node-a").await),
        Arc::new(cluster.node("node-b").await),
    ];
    let calls = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for i in 0..8 {
        let node = nodes[i % 2].clone();
        let calls = calls.clone();
        tasks.push(tokio::spawn(async move {
            node.get_or_load("orders", "shared", None, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, anyhow::Error>(order(99))
            })
            .await
            .unwrap()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), order(99));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_batch_operations() {
    let cluster = Cluster::new();
    let node = cluster.node("node-a").await;

    node.put_all(
        "orders",
        &[(1_u64, order(1)), (2_u64, order(2)), (3_u64, order(3))],
        None,
    )
    .await
    .unwrap();

    let full_2 = node.serializer().build_key("orders", &2_u64).unwrap();
    node.local_tier("orders").unwrap().delete(&full_2);

    let found = node
        .get_all::<Order, u64>("orders", &[1, 2, 4])
        .await
        .unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found.get(&1), Some(&order(1)));
    assert_eq!(found.get(&2), Some(&order(2)));
    assert!(!found.contains_key(&4));

    let snapshot = node.metrics_snapshot("orders");
    assert_eq!(snapshot.l1_hits, 1);
    assert_eq!(snapshot.l2_hits, 1);
    assert_eq!(snapshot.misses, 1);

    let removed = node.evict_all("orders", &[1_u64, 2, 4]).await.unwrap();
    assert_eq!(removed, 2);
    assert!(!node.exists("orders", &1_u64).await.unwrap());
    assert!(node.exists("orders", &3_u64).await.unwrap());
}

#[tokio::test]
async fn test_clear_is_scoped_to_one_cache_name() {
    let cluster = Cluster::new();
    let node_a = cluster.node("node-a").await;
    let node_b = cluster.node("node-b").await;

    node_a.put("orders", &1_u64, &order(1), None).await.unwrap();
    node_a.put("users", "alice", &"Alice", None).await.unwrap();
    let _: Option<Order> = node_b.get("orders", &1_u64).await.unwrap();

    node_a.clear("orders").await.unwrap();

    let orders_full = node_a.serializer().build_key("orders", &1_u64).unwrap();
    assert!(cluster.remote.ttl_of(&orders_full).is_none());
    assert!(node_b.local_tier("orders").unwrap().get(&orders_full).is_none());
    let user: Option<String> = node_a.get("users", "alice").await.unwrap();
    assert_eq!(user.as_deref(), Some("Alice"));

    node_b.clear_all().await.unwrap();
    assert!(cluster.remote.keys().is_empty());
    let user: Option<String> = node_a.get("users", "alice").await.unwrap();
    assert_eq!(user, None);
}

#[tokio::test]
async fn test_tenants_are_isolated() {
    let cluster = Cluster::new();
    let node = cluster.node("node-a").await;

    with_tenant("acme", async {
        node.put("orders", &1_u64, &order(1), None).await.unwrap();
    })
    .await;

    let default_view: Option<Order> = node.get("orders", &1_u64).await.unwrap();
    assert_eq!(default_view, None);

    let acme_view: Option<Order> = with_tenant("acme", async {
        node.get("orders", &1_u64).await.unwrap()
    })
    .await;
    assert_eq!(acme_view, Some(order(1)));
    assert!(
        cluster
            .remote
            .keys()
            .contains(&"tc:order_service:acme:orders:1".to_string())
    );
}

#[tokio::test]
async fn test_shutdown_stops_invalidations() {
    let cluster = Cluster::new();
    let node_a = cluster.node("node-a").await;
    let node_b = cluster.node("node-b").await;
    assert_eq!(cluster.bus.subscriber_count(), 2);

    node_a.put("orders", &1_u64, &order(1), None).await.unwrap();
    node_a.shutdown().await;
    node_a.shutdown().await;
    assert_eq!(cluster.bus.subscriber_count(), 1);

    node_b.evict("orders", &1_u64).await.unwrap();
    let full = node_a.serializer().build_key("orders", &1_u64).unwrap();
    // Stale until the local TTL runs out.
    assert!(node_a.local_tier("orders").unwrap().get(&full).is_some());
}

struct StalledRemote;

#[async_trait]
impl RemoteTier for StalledRemote {
    fn backend_name(&self) -> &'static str {
        "stalled"
    }

    async fn get(&self, _key: &str) -> CacheResult<Option<Vec<u8>>> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(None)
    }

    async fn put(&self, _key: &str, _value: &[u8], _ttl: Duration) -> CacheResult<()> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }

    async fn delete(&self, _key: &str) -> CacheResult<bool> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(false)
    }

    async fn exists(&self, _key: &str) -> CacheResult<bool> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(false)
    }

    async fn clear(&self, _pattern: &str) -> CacheResult<u64> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(0)
    }
}

#[tokio::test(start_paused = true)]
async fn test_remote_calls_time_out() {
    let node = TieredCache::builder()
        .with_node_id("node-a")
        .with_remote(Arc::new(StalledRemote))
        .with_remote_timeout(Duration::from_millis(50))
        .build()
        .await
        .unwrap();

    let err = node.put("orders", &1_u64, &order(1), None).await.err().unwrap();
    assert!(err.is_tier_unavailable());
    assert!(err.to_string().contains("timed out"));

    let read: Option<Order> = node.get("orders", &1_u64).await.unwrap();
    assert_eq!(read, None);
    assert_eq!(node.metrics_snapshot("orders").remote_errors, 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_loader_outlives_load_timeout() {
    let cluster = Cluster::new();
    let node = TieredCache::builder()
        .with_node_id("node-a")
        .with_remote(Arc::new(cluster.remote.clone()))
        .with_load_timeout(Duration::from_millis(100))
        .build()
        .await
        .unwrap();

    let value: u32 = node
        .get_or_load("orders", "slow", None, || async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok::<_, anyhow::Error>(7)
        })
        .await
        .unwrap();
    assert_eq!(value, 7);

    let full = node.serializer().build_key("orders", "slow").unwrap();
    assert!(cluster.remote.ttl_of(&full).is_some());
    assert_eq!(node.metrics_snapshot("orders").remote_errors, 0);
}

/// Reads miss at once; writes never finish.
struct SlowWriteRemote;

#[async_trait]
impl RemoteTier for SlowWriteRemote {
    fn backend_name(&self) -> &'static str {
        "slow-write"
    }

    async fn get(&self, _key: &str) -> CacheResult<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn put(&self, _key: &str, _value: &[u8], _ttl: Duration) -> CacheResult<()> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }

    async fn delete(&self, _key: &str) -> CacheResult<bool> {
        Ok(false)
    }

    async fn exists(&self, _key: &str) -> CacheResult<bool> {
        Ok(false)
    }

    async fn clear(&self, _pattern: &str) -> CacheResult<u64> {
        Ok(0)
    }
}

#[tokio::test(start_paused = true)]
async fn test_loaded_value_survives_a_stalled_remote_write() {
    let node = TieredCache::builder()
        .with_node_id("node-a")
        .with_remote(Arc::new(SlowWriteRemote))
        .with_load_timeout(Duration::from_millis(100))
        .build()
        .await
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let loader_calls = calls.clone();
    let value: u32 = node
        .get_or_load("orders", "k", None, || async move {
            loader_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(250)).await;
            Ok::<_, anyhow::Error>(11)
        })
        .await
        .unwrap();
    assert_eq!(value, 11);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(node.metrics_snapshot("orders").remote_errors, 1);

    // Kept in L1, so the loader is not needed again.
    let again: u32 = node
        .get_or_load("orders", "k", None, || async {
            Ok::<_, anyhow::Error>(0)
        })
        .await
        .unwrap();
    assert_eq!(again, 11);
}
