use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tiercache_core::duration::{iso8601, iso8601_option};
use tiercache_core::spec::{
    DEFAULT_BLOOM_EXPECTED_INSERTIONS, DEFAULT_BLOOM_FALSE_POSITIVE_RATE, DEFAULT_CLUSTER,
    DEFAULT_LOCAL_MAX_ENTRIES, DEFAULT_REMOTE_TTL,
};
use tiercache_core::{
    CacheResult, CacheSpecification, CacheSpecificationBuilder, SpecRegistry, TtlStrategy,
    validate_cache_name,
};
use tiercache_redis::RedisConfig;

use crate::locks::DEFAULT_LOCK_CAPACITY;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheConfig {
    #[serde(default)]
    pub node: NodeConfig,
    /// Settings of every cache-name without an override
    #[serde(default)]
    pub defaults: CacheDefaults,
    /// Per cache-name overrides
    #[serde(default)]
    pub caches: HashMap<String, CacheOverrides>,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,
    /// Upper bound of a remote `get_or_load`, loader included
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,
    /// Degrade instead of failing when a backend lacks a capability
    #[serde(default)]
    pub allow_degradation: bool,
    #[serde(default)]
    pub default_remote_bus: RemoteBus,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_remote_timeout_ms() -> u64 {
    5000
}
fn default_load_timeout_ms() -> u64 {
    5000
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.remote_timeout_ms == 0 || self.load_timeout_ms == 0 {
            return Err("remote_timeout_ms and load_timeout_ms must be > 0".into());
        }
        self.node.validate()?;
        self.redis.validate()?;
        self.idempotency.validate()?;
        // Builds every specification, which checks names, TTLs and filter settings.
        self.registry().map_err(|e| e.to_string())?;
        Ok(())
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    /// Specification registry of the configured defaults and overrides.
    pub fn registry(&self) -> CacheResult<SpecRegistry> {
        let defaults = self
            .defaults
            .apply(CacheSpecification::builder())
            .cluster_name(&self.node.cluster_name)
            .build()?;
        let registry = SpecRegistry::new(defaults.clone());
        for (name, overrides) in &self.caches {
            validate_cache_name(name)?;
            let spec = overrides.apply(defaults.to_builder()).build()?;
            registry.register(name.clone(), spec)?;
        }
        Ok(registry)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identity on the invalidation topic; generated when absent
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_application_name")]
    pub application_name: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Cluster of the default remote tier
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
}

fn default_application_name() -> String {
    "application".into()
}
fn default_key_prefix() -> String {
    "tiercache".into()
}
fn default_cluster_name() -> String {
    DEFAULT_CLUSTER.into()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            application_name: default_application_name(),
            key_prefix: default_key_prefix(),
            cluster_name: default_cluster_name(),
        }
    }
}

impl NodeConfig {
    fn validate(&self) -> Result<(), String> {
        if matches!(&self.id, Some(id) if id.trim().is_empty()) {
            return Err("node.id must not be empty when set".into());
        }
        if self.application_name.trim().is_empty() {
            return Err("node.application_name must not be empty".into());
        }
        if self.key_prefix.trim().is_empty() {
            return Err("node.key_prefix must not be empty".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheDefaults {
    /// Remote TTL as an ISO-8601 duration, e.g. "PT24H"
    #[serde(default = "default_ttl", with = "iso8601")]
    pub ttl: Duration,
    #[serde(default)]
    pub local_ttl: TtlStrategy,
    #[serde(default = "default_local_max_entries")]
    pub local_max_entries: u64,
    #[serde(default)]
    pub bloom_enabled: bool,
    #[serde(default = "default_bloom_expected_insertions")]
    pub bloom_expected_insertions: u64,
    #[serde(default = "default_bloom_false_positive_rate")]
    pub bloom_false_positive_rate: f64,
}

fn default_ttl() -> Duration {
    DEFAULT_REMOTE_TTL
}
fn default_local_max_entries() -> u64 {
    DEFAULT_LOCAL_MAX_ENTRIES
}
fn default_bloom_expected_insertions() -> u64 {
    DEFAULT_BLOOM_EXPECTED_INSERTIONS
}
fn default_bloom_false_positive_rate() -> f64 {
    DEFAULT_BLOOM_FALSE_POSITIVE_RATE
}

impl Default for CacheDefaults {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            local_ttl: TtlStrategy::default(),
            local_max_entries: default_local_max_entries(),
            bloom_enabled: false,
            bloom_expected_insertions: default_bloom_expected_insertions(),
            bloom_false_positive_rate: default_bloom_false_positive_rate(),
        }
    }
}

impl CacheDefaults {
    fn apply(&self, builder: CacheSpecificationBuilder) -> CacheSpecificationBuilder {
        builder
            .ttl_remote(self.ttl)
            .local_ttl_strategy(self.local_ttl)
            .local_max_entries(self.local_max_entries)
            .bloom_enabled(self.bloom_enabled)
            .bloom_expected_insertions(self.bloom_expected_insertions)
            .bloom_false_positive_rate(self.bloom_false_positive_rate)
    }
}

/// Per cache-name settings; unset fields inherit from `defaults`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheOverrides {
    #[serde(default, with = "iso8601_option", skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_ttl: Option<TtlStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_max_entries: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bloom_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bloom_expected_insertions: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bloom_false_positive_rate: Option<f64>,
}

impl CacheOverrides {
    fn apply(&self, mut builder: CacheSpecificationBuilder) -> CacheSpecificationBuilder {
        if let Some(ttl) = self.ttl {
            builder = builder.ttl_remote(ttl);
        }
        if let Some(strategy) = self.local_ttl {
            builder = builder.local_ttl_strategy(strategy);
        }
        if let Some(entries) = self.local_max_entries {
            builder = builder.local_max_entries(entries);
        }
        if let Some(cluster) = &self.cluster_name {
            builder = builder.cluster_name(cluster);
        }
        if let Some(enabled) = self.bloom_enabled {
            builder = builder.bloom_enabled(enabled);
        }
        if let Some(insertions) = self.bloom_expected_insertions {
            builder = builder.bloom_expected_insertions(insertions);
        }
        if let Some(rate) = self.bloom_false_positive_rate {
            builder = builder.bloom_false_positive_rate(rate);
        }
        builder
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Reserved cache-name of the dedup markers
    #[serde(default = "default_idempotency_cache_name")]
    pub cache_name: String,
    /// Dedup horizon as an ISO-8601 duration
    #[serde(default = "default_ttl", with = "iso8601")]
    pub ttl: Duration,
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,
    #[serde(default = "default_lock_retry_delay_ms")]
    pub lock_retry_delay_ms: u64,
    /// Maximum number of keys locked at once
    #[serde(default = "default_lock_capacity")]
    pub lock_capacity: usize,
}

fn default_idempotency_cache_name() -> String {
    "bus-idempotency".into()
}
fn default_lock_retries() -> u32 {
    3
}
fn default_lock_retry_delay_ms() -> u64 {
    10
}
fn default_lock_capacity() -> usize {
    DEFAULT_LOCK_CAPACITY
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            cache_name: default_idempotency_cache_name(),
            ttl: default_ttl(),
            lock_retries: default_lock_retries(),
            lock_retry_delay_ms: default_lock_retry_delay_ms(),
            lock_capacity: default_lock_capacity(),
        }
    }
}

impl IdempotencyConfig {
    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }

    fn validate(&self) -> Result<(), String> {
        validate_cache_name(&self.cache_name).map_err(|e| format!("idempotency.cache_name: {e}"))?;
        if self.ttl.is_zero() {
            return Err("idempotency.ttl must be positive".into());
        }
        if self.lock_capacity == 0 {
            return Err("idempotency.lock_capacity must be > 0".into());
        }
        Ok(())
    }
}

/// Which transport carries invalidations between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum RemoteBus {
    /// The remote store's pub/sub topic.
    #[default]
    Remote,
    /// No cross-node invalidation.
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::CacheConfig;
    use config::{Config, Environment, File};
    use std::path::{Path, PathBuf};

    pub const DEFAULT_CONFIG_FILE: &str = "tiercache.toml";

    pub fn load_config(path: Option<&str>) -> Result<CacheConfig, String> {
        let mut builder = Config::builder();
        let file = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if file.exists() {
            builder = builder.add_source(File::from(file));
        } else if path.is_some() {
            return Err(format!("config file not found: {}", file.display()));
        }
        // Environment variable overrides, e.g., TIERCACHE__REDIS__URL=redis://cache:6379
        builder = builder.add_source(
            Environment::with_prefix("TIERCACHE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: CacheConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }

    pub fn load_config_from<P: AsRef<Path>>(path: P) -> Result<CacheConfig, String> {
        let path = path.as_ref().to_string_lossy().to_string();
        load_config(Some(&path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.defaults.ttl, Duration::from_secs(86_400));
        assert_eq!(config.idempotency.cache_name, "bus-idempotency");
        assert_eq!(config.idempotency.lock_retries, 3);
        assert_eq!(config.default_remote_bus, RemoteBus::Remote);
        assert!(!config.allow_degradation);

        let registry = config.registry().unwrap();
        let spec = registry.resolve("anything").unwrap();
        assert_eq!(spec.local_ttl().unwrap(), Duration::from_secs(69_120));
    }

    #[test]
    fn test_overrides_inherit_defaults() {
        let mut config = CacheConfig::default();
        config.defaults.bloom_enabled = true;
        config.caches.insert(
            "orders".into(),
            CacheOverrides {
                ttl: Some(Duration::from_secs(600)),
                ..Default::default()
            },
        );
        let registry = config.registry().unwrap();
        let orders = registry.resolve("orders").unwrap();
        assert_eq!(orders.ttl_remote(), Duration::from_secs(600));
        assert_eq!(orders.local_ttl().unwrap(), Duration::from_secs(480));
        assert!(orders.bloom_enabled());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = CacheConfig::default();
        config.caches.insert("bad:name".into(), CacheOverrides::default());
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.defaults.local_ttl = TtlStrategy::FixedRatio { ratio: 1.5 };
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.idempotency.cache_name = "bus:idempotency".into();
        assert!(config.validate().is_err());

        let config = CacheConfig {
            remote_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_remote_bus_names() {
        let bus: RemoteBus = serde_json::from_str("\"LOCAL\"").unwrap();
        assert_eq!(bus, RemoteBus::Local);
        assert_eq!(serde_json::to_string(&RemoteBus::Remote).unwrap(), "\"REMOTE\"");
    }
}
