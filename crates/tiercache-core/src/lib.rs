//! Core building blocks of the tiercache engine.
//!
//! This crate holds everything the tiers and the orchestrator agree on:
//!
//! - [`KeySerializer`]: canonical, tenant-aware key strings
//! - [`TtlStrategy`]: local TTL derivation that never outlives the remote TTL
//! - [`CacheSpecification`] and [`SpecRegistry`]: per cache-name settings
//! - [`CacheEntry`]: versioned values and their MessagePack encoding
//! - [`InvalidationMessage`]: the cross-node wire format
//! - the [`LocalTier`], [`RemoteTier`], [`InvalidationChannel`] and
//!   [`MembershipFilter`] traits implemented by the adapter crates

pub mod duration;
pub mod entry;
pub mod error;
pub mod key;
pub mod message;
pub mod spec;
pub mod traits;
pub mod ttl;

pub use entry::{CacheEntry, peek_version};
pub use error::{CacheError, CacheResult, ErrorCategory, Tier};
pub use key::{
    CacheKey, DEFAULT_TENANT, Json, KeySerializer, ResolvedKey, ToCacheKey, current_tenant,
    validate_cache_name, with_tenant,
};
pub use message::{InvalidationKind, InvalidationMessage};
pub use spec::{CacheSpecification, CacheSpecificationBuilder, SpecRegistry};
pub use traits::{
    ByteLoader, InvalidationChannel, InvalidationHandler, LocalEntry, LocalTier, LocalTierFactory,
    Membership, MembershipFilter, RemoteTier,
};
pub use ttl::TtlStrategy;
