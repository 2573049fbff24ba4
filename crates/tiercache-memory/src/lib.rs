//! In-process collaborators for the tiercache engine.
//!
//! [`InMemoryRemoteTier`] implements the shared tier on a concurrent map and
//! [`InMemoryInvalidationBus`] the invalidation topic. Both can be shared by
//! several engines in one process to simulate a multi-node deployment.
//!
//! # Example
//!
//! ```ignore
//! use tiercache_memory::{InMemoryInvalidationBus, InMemoryRemoteTier};
//!
//! let remote = InMemoryRemoteTier::new();
//! let bus = InMemoryInvalidationBus::new();
//! let node_a = bus.connect("node-a");
//! let node_b = bus.connect("node-b");
//! ```

pub mod bus;
pub mod store;

pub use bus::{InMemoryInvalidationBus, InMemoryInvalidationChannel};
pub use store::InMemoryRemoteTier;
