//! Per cache-name settings.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::error::{CacheError, CacheResult};
use crate::key::validate_cache_name;
use crate::ttl::TtlStrategy;

pub const DEFAULT_REMOTE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_LOCAL_MAX_ENTRIES: u64 = 10_000;
pub const DEFAULT_BLOOM_EXPECTED_INSERTIONS: u64 = 10_000;
pub const DEFAULT_BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;
pub const DEFAULT_CLUSTER: &str = "default";

/// Immutable settings of one cache-name. Built with [`CacheSpecification::builder`].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSpecification {
    ttl_remote: Duration,
    local_ttl_strategy: TtlStrategy,
    local_max_entries: u64,
    cluster_name: String,
    bloom_enabled: bool,
    bloom_expected_insertions: u64,
    bloom_false_positive_rate: f64,
}

impl Default for CacheSpecification {
    fn default() -> Self {
        Self {
            ttl_remote: DEFAULT_REMOTE_TTL,
            local_ttl_strategy: TtlStrategy::default(),
            local_max_entries: DEFAULT_LOCAL_MAX_ENTRIES,
            cluster_name: DEFAULT_CLUSTER.to_string(),
            bloom_enabled: false,
            bloom_expected_insertions: DEFAULT_BLOOM_EXPECTED_INSERTIONS,
            bloom_false_positive_rate: DEFAULT_BLOOM_FALSE_POSITIVE_RATE,
        }
    }
}

impl CacheSpecification {
    pub fn builder() -> CacheSpecificationBuilder {
        CacheSpecificationBuilder {
            spec: Self::default(),
        }
    }

    /// Starts a builder seeded with this specification's values.
    pub fn to_builder(&self) -> CacheSpecificationBuilder {
        CacheSpecificationBuilder { spec: self.clone() }
    }

    pub fn ttl_remote(&self) -> Duration {
        self.ttl_remote
    }

    pub fn local_ttl_strategy(&self) -> TtlStrategy {
        self.local_ttl_strategy
    }

    pub fn local_max_entries(&self) -> u64 {
        self.local_max_entries
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn bloom_enabled(&self) -> bool {
        self.bloom_enabled
    }

    pub fn bloom_expected_insertions(&self) -> u64 {
        self.bloom_expected_insertions
    }

    pub fn bloom_false_positive_rate(&self) -> f64 {
        self.bloom_false_positive_rate
    }

    /// Local TTL for the spec's remote TTL.
    pub fn local_ttl(&self) -> CacheResult<Duration> {
        self.local_ttl_strategy.local_ttl(self.ttl_remote)
    }

    /// Remote and local TTL for a write, honoring an optional per-call TTL.
    pub fn ttls_for(&self, ttl: Option<Duration>) -> CacheResult<(Duration, Duration)> {
        let remote = ttl.unwrap_or(self.ttl_remote);
        let local = self.local_ttl_strategy.local_ttl(remote)?;
        Ok((remote, local))
    }

    fn validate(&self) -> CacheResult<()> {
        if self.ttl_remote.is_zero() {
            return Err(CacheError::invalid_configuration("remote TTL must be positive"));
        }
        if self.local_max_entries == 0 {
            return Err(CacheError::invalid_configuration(
                "local max entries must be positive",
            ));
        }
        if self.cluster_name.trim().is_empty() {
            return Err(CacheError::invalid_configuration("cluster name is empty"));
        }
        if self.bloom_expected_insertions == 0 {
            return Err(CacheError::invalid_configuration(
                "bloom expected insertions must be positive",
            ));
        }
        let fpp = self.bloom_false_positive_rate;
        if !(fpp > 0.0 && fpp < 1.0) {
            return Err(CacheError::invalid_configuration(format!(
                "bloom false positive rate must be in (0, 1), got {fpp}"
            )));
        }
        // Also enforces local <= remote for the configured TTL.
        self.local_ttl().map(|_| ())
    }
}

/// Builder for [`CacheSpecification`].
#[derive(Debug, Clone)]
pub struct CacheSpecificationBuilder {
    spec: CacheSpecification,
}

impl CacheSpecificationBuilder {
    pub fn ttl_remote(mut self, ttl: Duration) -> Self {
        self.spec.ttl_remote = ttl;
        self
    }

    pub fn local_ttl_strategy(mut self, strategy: TtlStrategy) -> Self {
        self.spec.local_ttl_strategy = strategy;
        self
    }

    pub fn local_max_entries(mut self, entries: u64) -> Self {
        self.spec.local_max_entries = entries;
        self
    }

    pub fn cluster_name(mut self, name: impl Into<String>) -> Self {
        self.spec.cluster_name = name.into();
        self
    }

    pub fn bloom_enabled(mut self, enabled: bool) -> Self {
        self.spec.bloom_enabled = enabled;
        self
    }

    pub fn bloom_expected_insertions(mut self, insertions: u64) -> Self {
        self.spec.bloom_expected_insertions = insertions;
        self
    }

    pub fn bloom_false_positive_rate(mut self, rate: f64) -> Self {
        self.spec.bloom_false_positive_rate = rate;
        self
    }

    /// Validates and freezes the specification.
    pub fn build(self) -> CacheResult<CacheSpecification> {
        self.spec.validate()?;
        Ok(self.spec)
    }
}

/// Resolves the specification of a cache-name.
///
/// Names without an explicit registration get the default specification.
#[derive(Debug)]
pub struct SpecRegistry {
    defaults: Arc<CacheSpecification>,
    specs: DashMap<String, Arc<CacheSpecification>>,
}

impl Default for SpecRegistry {
    fn default() -> Self {
        Self::new(CacheSpecification::default())
    }
}

impl SpecRegistry {
    pub fn new(defaults: CacheSpecification) -> Self {
        Self {
            defaults: Arc::new(defaults),
            specs: DashMap::new(),
        }
    }

    /// Registers (or replaces) the specification of `cache_name`.
    pub fn register(
        &self,
        cache_name: impl Into<String>,
        spec: CacheSpecification,
    ) -> CacheResult<()> {
        let cache_name = cache_name.into();
        validate_cache_name(&cache_name)?;
        self.specs.insert(cache_name, Arc::new(spec));
        Ok(())
    }

    /// Returns the specification for `cache_name`.
    pub fn resolve(&self, cache_name: &str) -> CacheResult<Arc<CacheSpecification>> {
        validate_cache_name(cache_name)?;
        Ok(self
            .specs
            .get(cache_name)
            .map(|spec| spec.value().clone())
            .unwrap_or_else(|| self.defaults.clone()))
    }

    pub fn defaults(&self) -> &CacheSpecification {
        &self.defaults
    }

    /// Names with an explicit registration.
    pub fn registered_names(&self) -> Vec<String> {
        self.specs.iter().map(|entry| entry.key().clone()).collect()
    }
}
