//! Error types shared by every cache tier and the orchestrator.

use std::fmt;
use std::time::Duration;

/// Result alias used across the cache crates.
pub type CacheResult<T> = Result<T, CacheError>;

/// The tier an I/O failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// In-process cache (L1).
    Local,
    /// Shared networked cache (L2).
    Remote,
    /// Invalidation transport.
    Channel,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
            Self::Channel => write!(f, "channel"),
        }
    }
}

/// Errors that can occur during cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// A tier could not be reached or failed while serving the call.
    #[error("{tier} tier unavailable: {message}")]
    TierUnavailable {
        /// Which tier failed.
        tier: Tier,
        /// Description of the failure.
        message: String,
    },

    /// A key or value could not be encoded or decoded.
    #[error("Serialization failure: {message}")]
    Serialization {
        /// Description of the encoding problem.
        message: String,
    },

    /// A cache-name, specification, TTL or setting is missing or invalid.
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration {
        /// Description of the configuration problem.
        message: String,
    },

    /// An idempotency lock was not acquired within its retry budget.
    #[error("Lock not acquired for key: {key}")]
    LockTimeout {
        /// The key whose lock was contended.
        key: String,
    },

    /// The caller-supplied loader of `get_or_load` failed.
    #[error("Loader failed: {0:#}")]
    Loader(anyhow::Error),
}

impl CacheError {
    /// Creates a `TierUnavailable` error for the given tier.
    #[must_use]
    pub fn unavailable(tier: Tier, message: impl Into<String>) -> Self {
        Self::TierUnavailable {
            tier,
            message: message.into(),
        }
    }

    /// Creates a `TierUnavailable` error for the remote tier.
    #[must_use]
    pub fn remote(message: impl Into<String>) -> Self {
        Self::unavailable(Tier::Remote, message)
    }

    /// Creates a `TierUnavailable` error for the invalidation channel.
    #[must_use]
    pub fn channel(message: impl Into<String>) -> Self {
        Self::unavailable(Tier::Channel, message)
    }

    /// Creates the error reported when a remote call exceeds its timeout.
    #[must_use]
    pub fn timeout(operation: &str, after: Duration) -> Self {
        Self::remote(format!("{operation} timed out after {}ms", after.as_millis()))
    }

    /// Creates a new `Serialization` error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidConfiguration` error.
    #[must_use]
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Creates a new `LockTimeout` error.
    #[must_use]
    pub fn lock_timeout(key: impl Into<String>) -> Self {
        Self::LockTimeout { key: key.into() }
    }

    /// Wraps a loader failure.
    #[must_use]
    pub fn loader(error: impl Into<anyhow::Error>) -> Self {
        Self::Loader(error.into())
    }

    /// Returns `true` if this is a `TierUnavailable` error.
    #[must_use]
    pub fn is_tier_unavailable(&self) -> bool {
        matches!(self, Self::TierUnavailable { .. })
    }

    /// Returns `true` if this is a `Serialization` error.
    #[must_use]
    pub fn is_serialization(&self) -> bool {
        matches!(self, Self::Serialization { .. })
    }

    /// Returns `true` if this is an `InvalidConfiguration` error.
    #[must_use]
    pub fn is_invalid_configuration(&self) -> bool {
        matches!(self, Self::InvalidConfiguration { .. })
    }

    /// Returns `true` if this is a `LockTimeout` error.
    #[must_use]
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    /// Returns the error category for metrics and logging.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::TierUnavailable { .. } => ErrorCategory::Infrastructure,
            Self::Serialization { .. } => ErrorCategory::Encoding,
            Self::InvalidConfiguration { .. } => ErrorCategory::Configuration,
            Self::LockTimeout { .. } => ErrorCategory::Contention,
            Self::Loader(_) => ErrorCategory::Loader,
        }
    }
}

impl From<rmp_serde::encode::Error> for CacheError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CacheError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

/// Categories of cache errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Backend or network failure.
    Infrastructure,
    /// Key or value encoding.
    Encoding,
    /// Bad settings or unknown cache-name.
    Configuration,
    /// Lock contention.
    Contention,
    /// Caller-supplied loader.
    Loader,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Encoding => write!(f, "encoding"),
            Self::Configuration => write!(f, "configuration"),
            Self::Contention => write!(f, "contention"),
            Self::Loader => write!(f, "loader"),
        }
    }
}
