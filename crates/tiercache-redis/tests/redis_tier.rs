//! Integration tests for the Redis adapters.
//!
//! Tests use testcontainers to spin up a real Redis instance.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tiercache_core::{InvalidationChannel, InvalidationMessage, RemoteTier};
use tiercache_redis::{RedisConfig, RedisInvalidationChannel, RedisRemoteTier, create_pool};
use tokio::sync::OnceCell;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

/// Get or create the shared Redis container
async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

async fn redis_config() -> RedisConfig {
    RedisConfig {
        enabled: true,
        url: get_redis_url().await,
        ..Default::default()
    }
}

async fn remote_tier() -> RedisRemoteTier {
    let pool = create_pool(&redis_config().await).await.expect("redis pool");
    RedisRemoteTier::new(pool)
}

/// Unique key namespace per test so tests can share the container.
fn ns(test: &str) -> String {
    format!("it:{}:{}", test, uuid::Uuid::new_v4().simple())
}

#[tokio::test]
async fn test_put_get_delete() {
    let tier = remote_tier().await;
    let key = format!("{}:orders:42", ns("crud"));

    tier.put(&key, b"order-42", Duration::from_secs(60)).await.unwrap();
    assert_eq!(tier.get(&key).await.unwrap(), Some(b"order-42".to_vec()));
    assert!(tier.exists(&key).await.unwrap());

    assert!(tier.delete(&key).await.unwrap());
    assert!(!tier.delete(&key).await.unwrap());
    assert_eq!(tier.get(&key).await.unwrap(), None);
}

#[tokio::test]
async fn test_ttl_is_enforced_server_side() {
    let tier = remote_tier().await;
    let key = format!("{}:short", ns("ttl"));

    tier.put(&key, b"v", Duration::from_millis(150)).await.unwrap();
    assert!(tier.exists(&key).await.unwrap());
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!tier.exists(&key).await.unwrap());
}

#[tokio::test]
async fn test_batch_operations() {
    let tier = remote_tier().await;
    let base = ns("batch");
    let entries: Vec<(String, Vec<u8>)> = (0..5)
        .map(|i| (format!("{base}:k{i}"), vec![i as u8]))
        .collect();
    tier.put_many(&entries, Duration::from_secs(60)).await.unwrap();

    let mut keys: Vec<String> = entries.iter().map(|(k, _)| k.clone()).collect();
    keys.push(format!("{base}:missing"));
    let values = tier.get_many(&keys).await.unwrap();
    assert_eq!(values.len(), 6);
    assert_eq!(values[3], Some(vec![3u8]));
    assert_eq!(values[5], None);

    assert_eq!(tier.delete_many(&keys).await.unwrap(), 5);
}

#[tokio::test]
async fn test_clear_by_pattern() {
    let tier = remote_tier().await;
    let base = ns("clear");
    let ttl = Duration::from_secs(60);
    for i in 0..20 {
        tier.put(&format!("{base}:t1:orders:{i}"), b"o", ttl).await.unwrap();
    }
    tier.put(&format!("{base}:t1:users:1"), b"u", ttl).await.unwrap();

    let removed = tier.clear(&format!("{base}:*:orders:*")).await.unwrap();
    assert_eq!(removed, 20);
    assert!(tier.exists(&format!("{base}:t1:users:1")).await.unwrap());
}

#[tokio::test]
async fn test_put_if_absent() {
    let tier = remote_tier().await;
    let key = format!("{}:marker", ns("nx"));
    let ttl = Duration::from_secs(60);

    assert!(tier.supports_conditional_write());
    assert!(tier.put_if_absent(&key, b"processed", ttl).await.unwrap());
    assert!(!tier.put_if_absent(&key, b"processed", ttl).await.unwrap());
}

#[tokio::test]
async fn test_get_or_load_collapses_concurrent_loads() {
    let tier = Arc::new(remote_tier().await);
    let key = format!("{}:expensive", ns("load"));
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let tier = tier.clone();
        let key = key.clone();
        let calls = calls.clone();
        handles.push(tokio::spawn(async move {
            tier.get_or_load(
                &key,
                Duration::from_secs(60),
                Box::new(move || {
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(b"computed".to_vec())
                    }
                    .boxed()
                }),
            )
            .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), b"computed".to_vec());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unreachable_redis_is_tier_unavailable() {
    let config = RedisConfig {
        enabled: true,
        url: "redis://127.0.0.1:1".into(),
        timeout_ms: 200,
        ..Default::default()
    };
    let err = create_pool(&config).await.unwrap_err();
    assert!(err.is_tier_unavailable());
}

#[tokio::test]
async fn test_pubsub_delivers_to_peers_only() {
    let config = redis_config().await;
    let pool = create_pool(&config).await.unwrap();
    let topic = ns("topic");

    let node_a = RedisInvalidationChannel::new(pool.clone(), &config.url, &topic, "node-a");
    let node_b = RedisInvalidationChannel::new(pool.clone(), &config.url, &topic, "node-b");

    let seen_a = Arc::new(AtomicUsize::new(0));
    let seen_b = Arc::new(AtomicUsize::new(0));
    let (a, b) = (seen_a.clone(), seen_b.clone());
    node_a
        .subscribe(Arc::new(move |_m: InvalidationMessage| {
            a.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();
    node_b
        .subscribe(Arc::new(move |_m: InvalidationMessage| {
            b.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();
    assert!(node_a.is_listening());

    node_a
        .publish(&InvalidationMessage::of_key("orders", "42", None, None, "node-a"))
        .await
        .unwrap();

    for _ in 0..50 {
        if seen_b.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(seen_b.load(Ordering::SeqCst), 1);
    assert_eq!(seen_a.load(Ordering::SeqCst), 0);

    node_a.unsubscribe().await;
    node_a.unsubscribe().await;
    assert!(!node_a.is_listening());
}
