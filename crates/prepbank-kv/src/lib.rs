//! Shared key-value store contract for PrepBank.
//!
//! All cache-protection and session-control components talk to the store
//! through the [`KvStore`] trait. Two backends are provided:
//!
//! - [`RedisKv`] — production backend over a `deadpool-redis` pool, shared
//!   across service instances.
//! - [`MemoryKv`] — single-instance backend and test double, with lazy
//!   per-key expiry and fault injection.
//!
//! The store is the only shared mutable resource in this layer. All
//! coordination (per-key cache locks, per-user login locks) is built from its
//! atomic primitives: conditional set (`NX`/`EX`) and token-checked delete.
//! No multi-key transactions are used.

pub mod error;
pub mod lock;
pub mod memory;
pub mod redis_store;
pub mod store;

pub use error::{KvError, KvResult};
pub use lock::{RetryBackoff, lock_token, release_lock, try_acquire_lock};
pub use memory::MemoryKv;
pub use redis_store::RedisKv;
pub use store::{KvStore, SetOptions};

/// Type alias for a shareable store handle.
pub type DynKvStore = std::sync::Arc<dyn KvStore>;
