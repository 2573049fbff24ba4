//! Local (L1) TTL derivation from the remote (L2) TTL.
//!
//! Every strategy returns a value no larger than the remote TTL, so a local
//! copy never outlives the authoritative one.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::iso8601;
use crate::error::{CacheError, CacheResult};

/// Ratio applied when nothing else is configured.
pub const DEFAULT_LOCAL_TTL_RATIO: f64 = 0.8;

/// How the local TTL is derived from the remote TTL.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TtlStrategy {
    /// `remote * ratio`, ratio in (0, 1].
    FixedRatio { ratio: f64 },
    /// A fixed local TTL, capped at the remote TTL.
    FixedDuration {
        #[serde(with = "iso8601")]
        ttl: Duration,
    },
    /// A separately configured local TTL, capped at the remote TTL.
    Independent {
        #[serde(with = "iso8601")]
        ttl: Duration,
    },
}

impl Default for TtlStrategy {
    fn default() -> Self {
        Self::FixedRatio {
            ratio: DEFAULT_LOCAL_TTL_RATIO,
        }
    }
}

impl TtlStrategy {
    /// Creates a ratio strategy, validating the ratio.
    pub fn fixed_ratio(ratio: f64) -> CacheResult<Self> {
        let strategy = Self::FixedRatio { ratio };
        strategy.validate()?;
        Ok(strategy)
    }

    /// Checks the strategy parameters.
    pub fn validate(&self) -> CacheResult<()> {
        match self {
            Self::FixedRatio { ratio } => {
                if !(ratio.is_finite() && *ratio > 0.0 && *ratio <= 1.0) {
                    return Err(CacheError::invalid_configuration(format!(
                        "local TTL ratio must be in (0, 1], got {ratio}"
                    )));
                }
            }
            Self::FixedDuration { ttl } | Self::Independent { ttl } => {
                if ttl.is_zero() {
                    return Err(CacheError::invalid_configuration(
                        "local TTL must be positive",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Computes the local TTL for a remote TTL.
    pub fn local_ttl(&self, remote_ttl: Duration) -> CacheResult<Duration> {
        if remote_ttl.is_zero() {
            return Err(CacheError::invalid_configuration(
                "remote TTL must be positive",
            ));
        }
        self.validate()?;

        let local = match self {
            Self::FixedRatio { ratio } => {
                Duration::from_nanos((remote_ttl.as_nanos() as f64 * ratio).round() as u64)
            }
            Self::FixedDuration { ttl } | Self::Independent { ttl } => *ttl,
        };
        if local.is_zero() {
            return Err(CacheError::invalid_configuration(format!(
                "local TTL for remote TTL {remote_ttl:?} rounds to zero"
            )));
        }
        Ok(local.min(remote_ttl))
    }
}
