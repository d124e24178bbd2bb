//! The key-value store trait consumed by the cache guards and the session
//! controller.
//!
//! The surface mirrors the subset of Redis commands this layer relies on:
//! strings with conditional set and expiry, lists, sets, hashes, and a
//! token-checked delete executed as a single atomic unit. Implementations
//! must make `compare_and_delete` atomic with respect to concurrent writers
//! of the same key; everything else only needs per-command atomicity.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::KvResult;

/// Options for [`KvStore::set`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Expire the key after this duration (`EX`).
    pub ttl: Option<Duration>,
    /// Only write if the key does not already exist (`NX`).
    pub if_not_exists: bool,
}

impl SetOptions {
    /// Plain unconditional set with no expiry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set with expiry.
    pub fn ex(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Only set if the key is absent.
    pub fn nx(mut self) -> Self {
        self.if_not_exists = true;
        self
    }
}

/// Async key-value store interface.
///
/// Implementations are provided for Redis ([`crate::RedisKv`]) and for
/// in-process memory ([`crate::MemoryKv`]).
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get the string value at `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    /// Set `key` to `value` under the given options.
    ///
    /// Returns `true` if the write happened. With `if_not_exists` set, a
    /// `false` return means the key was already present.
    async fn set(&self, key: &str, value: &str, opts: SetOptions) -> KvResult<bool>;

    /// Delete `key`. Returns `true` if a key was removed.
    async fn delete(&self, key: &str) -> KvResult<bool>;

    /// Set or refresh the expiry on an existing key. Returns `false` if the
    /// key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool>;

    /// Whether `key` exists.
    async fn exists(&self, key: &str) -> KvResult<bool>;

    /// Append values to the tail of the list at `key`, creating it if
    /// absent. Returns the resulting list length.
    async fn rpush(&self, key: &str, values: &[String]) -> KvResult<u64>;

    /// Range of list elements, inclusive, with Redis index semantics
    /// (negative indices count from the tail, `-1` is the last element).
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> KvResult<Vec<String>>;

    /// Element at `index` (negative counts from the tail), or `None`.
    async fn lindex(&self, key: &str, index: i64) -> KvResult<Option<String>>;

    /// Remove occurrences of `value` from the list: `count > 0` removes from
    /// the head, `count < 0` from the tail, `0` removes all. Returns the
    /// number removed.
    async fn lrem(&self, key: &str, count: i64, value: &str) -> KvResult<u64>;

    /// Add members to the set at `key`. Returns the number newly added.
    async fn sadd(&self, key: &str, members: &[String]) -> KvResult<u64>;

    /// All members of the set at `key` (empty if absent).
    async fn smembers(&self, key: &str) -> KvResult<Vec<String>>;

    /// Remove members from the set at `key`. Returns the number removed.
    async fn srem(&self, key: &str, members: &[String]) -> KvResult<u64>;

    /// Set hash fields at `key`.
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> KvResult<()>;

    /// All field/value pairs of the hash at `key` (empty if absent).
    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, String>>;

    /// Increment an integer hash field by `delta`, creating it at zero if
    /// absent. Returns the new value.
    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> KvResult<i64>;

    /// Delete `key` only if its current string value equals `token`,
    /// atomically. Returns `true` if the key was deleted.
    ///
    /// This is the lock-release primitive: it never deletes a lock that has
    /// expired and been re-acquired by another holder.
    async fn compare_and_delete(&self, key: &str, token: &str) -> KvResult<bool>;
}
