use std::io::Write;
use std::time::Duration;

use tiercache::config::loader::{load_config, load_config_from};
use tiercache::{CacheConfig, TieredCache, TtlStrategy};

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_load_file_with_overrides() {
    let file = write_config(
        r#"
allow_degradation = true
default_remote_bus = "LOCAL"

[node]
id = "node-a"
application_name = "orderService"
key_prefix = "tc"

[defaults]
ttl = "PT1H"
bloom_enabled = true

[caches.orders]
ttl = "PT10M"
local_ttl = { kind = "fixed_duration", ttl = "PT1M" }

[caches.sessions]
bloom_enabled = false

[idempotency]
lock_retries = 5
"#,
    );

    let config = load_config_from(file.path()).unwrap();
    assert_eq!(config.node.id.as_deref(), Some("node-a"));
    assert_eq!(config.defaults.ttl, Duration::from_secs(3600));
    assert_eq!(config.idempotency.lock_retries, 5);
    assert_eq!(config.idempotency.cache_name, "bus-idempotency");
    assert!(!config.redis.enabled);

    let registry = config.registry().unwrap();
    let orders = registry.resolve("orders").unwrap();
    assert_eq!(orders.ttl_remote(), Duration::from_secs(600));
    assert_eq!(orders.local_ttl().unwrap(), Duration::from_secs(60));
    assert!(orders.bloom_enabled());

    let sessions = registry.resolve("sessions").unwrap();
    assert!(!sessions.bloom_enabled());
    assert_eq!(sessions.ttl_remote(), Duration::from_secs(3600));
    assert_eq!(
        sessions.local_ttl_strategy(),
        TtlStrategy::FixedRatio { ratio: 0.8 }
    );
}

#[tokio::test]
async fn test_engine_from_file_runs_local_only() {
    let file = write_config(
        r#"
[node]
id = "node-a"
application_name = "billing"
"#,
    );
    let config = load_config_from(file.path()).unwrap();
    let cache = TieredCache::from_config(&config).await.unwrap();

    assert_eq!(cache.node_id(), "node-a");
    assert!(!cache.has_remote());

    cache.put("invoices", "inv-1", &100_u32, None).await.unwrap();
    let read: Option<u32> = cache.get("invoices", "inv-1").await.unwrap();
    assert_eq!(read, Some(100));
    assert_eq!(
        cache.serializer().build_key("invoices", &7_u64).unwrap(),
        "tiercache:billing:default:invoices:7"
    );
}

#[test]
fn test_missing_explicit_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.toml");
    let err = load_config_from(&missing).unwrap_err();
    assert!(err.contains("not found"));
}

#[test]
fn test_invalid_values_are_rejected() {
    let file = write_config(
        r#"
[caches."bad:name"]
ttl = "PT1M"
"#,
    );
    assert!(load_config_from(file.path()).is_err());

    let file = write_config(
        r#"
[defaults]
ttl = "one day"
"#,
    );
    let err = load_config_from(file.path()).unwrap_err();
    assert!(err.contains("deserialize"));

    let file = write_config("remote_timeout_ms = 0\n");
    assert!(load_config(Some(&file.path().to_string_lossy())).is_err());
}

#[test]
fn test_default_config_round_trips_through_toml() {
    let rendered = toml::to_string(&CacheConfig::default()).unwrap();
    assert!(rendered.contains("ttl = \"P1D\""));

    let parsed: CacheConfig = toml::from_str(&rendered).unwrap();
    assert!(parsed.validate().is_ok());
    assert_eq!(parsed.defaults.ttl, Duration::from_secs(86_400));
    assert_eq!(parsed.defaults.local_ttl, TtlStrategy::default());
    assert_eq!(parsed.idempotency.ttl, Duration::from_secs(86_400));
    assert_eq!(parsed.default_remote_bus, CacheConfig::default().default_remote_bus);
}
