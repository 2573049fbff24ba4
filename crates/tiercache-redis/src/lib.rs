//! Redis adapters for the tiercache engine.
//!
//! - [`RedisRemoteTier`]: the shared (L2) tier, with fleet-wide load locks
//!   for `get_or_load` and native conditional writes (`SET NX PX`)
//! - [`RedisInvalidationChannel`]: the invalidation topic over Redis Pub/Sub
//!
//! Both share a `deadpool-redis` pool built by [`create_pool`].

pub mod config;
pub mod pubsub;
pub mod remote;

pub use config::{RedisConfig, create_pool};
pub use pubsub::RedisInvalidationChannel;
pub use remote::RedisRemoteTier;
