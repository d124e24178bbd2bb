//! In-memory store backend.
//!
//! Single-instance deployments and tests use this backend. Expiry is lazy:
//! an expired entry is dropped when it is next touched, never by a
//! background sweep. The whole map sits behind one mutex; no lock is held
//! across an await point because every operation completes synchronously.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{KvError, KvResult};
use crate::store::{KvStore, SetOptions};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(Vec<String>),
    Set(HashSet<String>),
    Hash(HashMap<String, String>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Hash(_) => "hash",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

/// In-memory [`KvStore`] implementation.
///
/// Also the test double for the Redis backend: [`MemoryKv::set_offline`]
/// makes every subsequent operation fail with [`KvError::Unavailable`] so
/// fail-open paths can be exercised.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
    offline: AtomicBool,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate backend unavailability for every subsequent operation.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Remaining time-to-live of `key`, if it exists and carries an expiry.
    /// Diagnostic helper, not part of the [`KvStore`] contract.
    pub fn time_to_live(&self, key: &str) -> Option<Duration> {
        let mut entries = self.entries.lock();
        let entry = Self::live_entry(&mut entries, key)?;
        entry
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    fn check_online(&self) -> KvResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(KvError::unavailable("memory store is offline"))
        } else {
            Ok(())
        }
    }

    /// Drop the entry at `key` if it has expired, then return it.
    fn live_entry<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
        if entries.get(key).is_some_and(Entry::is_expired) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    fn wrong_type(key: &str, found: &Value, wanted: &str) -> KvError {
        KvError::protocol(format!(
            "key {key} holds a {} value, expected {wanted}",
            found.type_name()
        ))
    }
}

/// Translate a Redis-style list index to a concrete offset, or `None` when
/// it falls off the front of the list.
fn resolve_index(len: usize, index: i64) -> Option<usize> {
    if index >= 0 {
        Some(index as usize)
    } else {
        len.checked_sub(index.unsigned_abs() as usize)
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.check_online()?;
        let mut entries = self.entries.lock();
        match Self::live_entry(&mut entries, key) {
            Some(entry) => match &entry.value {
                Value::Str(s) => Ok(Some(s.clone())),
                other => Err(Self::wrong_type(key, other, "string")),
            },
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, opts: SetOptions) -> KvResult<bool> {
        self.check_online()?;
        let mut entries = self.entries.lock();
        if opts.if_not_exists && Self::live_entry(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: opts.ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> KvResult<bool> {
        self.check_online()?;
        let mut entries = self.entries.lock();
        let existed = Self::live_entry(&mut entries, key).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        self.check_online()?;
        let mut entries = self.entries.lock();
        match Self::live_entry(&mut entries, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        self.check_online()?;
        let mut entries = self.entries.lock();
        Ok(Self::live_entry(&mut entries, key).is_some())
    }

    async fn rpush(&self, key: &str, values: &[String]) -> KvResult<u64> {
        self.check_online()?;
        let mut entries = self.entries.lock();
        match Self::live_entry(&mut entries, key) {
            Some(entry) => match &mut entry.value {
                Value::List(list) => {
                    list.extend(values.iter().cloned());
                    Ok(list.len() as u64)
                }
                other => Err(Self::wrong_type(key, other, "list")),
            },
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::List(values.to_vec()),
                        expires_at: None,
                    },
                );
                Ok(values.len() as u64)
            }
        }
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> KvResult<Vec<String>> {
        self.check_online()?;
        let mut entries = self.entries.lock();
        match Self::live_entry(&mut entries, key) {
            Some(entry) => match &entry.value {
                Value::List(list) => {
                    let len = list.len();
                    let from = resolve_index(len, start).unwrap_or(0);
                    let to = match resolve_index(len, stop) {
                        Some(i) => i.min(len.saturating_sub(1)),
                        None => return Ok(Vec::new()),
                    };
                    if from > to || from >= len {
                        return Ok(Vec::new());
                    }
                    Ok(list[from..=to].to_vec())
                }
                other => Err(Self::wrong_type(key, other, "list")),
            },
            None => Ok(Vec::new()),
        }
    }

    async fn lindex(&self, key: &str, index: i64) -> KvResult<Option<String>> {
        self.check_online()?;
        let mut entries = self.entries.lock();
        match Self::live_entry(&mut entries, key) {
            Some(entry) => match &entry.value {
                Value::List(list) => Ok(resolve_index(list.len(), index)
                    .and_then(|i| list.get(i))
                    .cloned()),
                other => Err(Self::wrong_type(key, other, "list")),
            },
            None => Ok(None),
        }
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> KvResult<u64> {
        self.check_online()?;
        let mut entries = self.entries.lock();
        let Some(entry) = Self::live_entry(&mut entries, key) else {
            return Ok(0);
        };
        let list = match &mut entry.value {
            Value::List(list) => list,
            other => return Err(Self::wrong_type(key, other, "list")),
        };
        let mut budget = if count == 0 {
            usize::MAX
        } else {
            count.unsigned_abs() as usize
        };
        let before = list.len();
        if count < 0 {
            // Remove from the tail.
            let mut i = list.len();
            while i > 0 && budget > 0 {
                i -= 1;
                if list[i] == value {
                    list.remove(i);
                    budget -= 1;
                }
            }
        } else {
            let mut i = 0;
            while i < list.len() && budget > 0 {
                if list[i] == value {
                    list.remove(i);
                    budget -= 1;
                } else {
                    i += 1;
                }
            }
        }
        let removed = (before - list.len()) as u64;
        if list.is_empty() {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> KvResult<u64> {
        self.check_online()?;
        let mut entries = self.entries.lock();
        match Self::live_entry(&mut entries, key) {
            Some(entry) => match &mut entry.value {
                Value::Set(set) => {
                    let mut added = 0;
                    for member in members {
                        if set.insert(member.clone()) {
                            added += 1;
                        }
                    }
                    Ok(added)
                }
                other => Err(Self::wrong_type(key, other, "set")),
            },
            None => {
                let set: HashSet<String> = members.iter().cloned().collect();
                let added = set.len() as u64;
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Set(set),
                        expires_at: None,
                    },
                );
                Ok(added)
            }
        }
    }

    async fn smembers(&self, key: &str) -> KvResult<Vec<String>> {
        self.check_online()?;
        let mut entries = self.entries.lock();
        match Self::live_entry(&mut entries, key) {
            Some(entry) => match &entry.value {
                Value::Set(set) => Ok(set.iter().cloned().collect()),
                other => Err(Self::wrong_type(key, other, "set")),
            },
            None => Ok(Vec::new()),
        }
    }

    async fn srem(&self, key: &str, members: &[String]) -> KvResult<u64> {
        self.check_online()?;
        let mut entries = self.entries.lock();
        let Some(entry) = Self::live_entry(&mut entries, key) else {
            return Ok(0);
        };
        let set = match &mut entry.value {
            Value::Set(set) => set,
            other => return Err(Self::wrong_type(key, other, "set")),
        };
        let mut removed = 0;
        for member in members {
            if set.remove(member) {
                removed += 1;
            }
        }
        if set.is_empty() {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> KvResult<()> {
        self.check_online()?;
        let mut entries = self.entries.lock();
        match Self::live_entry(&mut entries, key) {
            Some(entry) => match &mut entry.value {
                Value::Hash(hash) => {
                    for (field, value) in fields {
                        hash.insert(field.clone(), value.clone());
                    }
                    Ok(())
                }
                other => Err(Self::wrong_type(key, other, "hash")),
            },
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Hash(fields.iter().cloned().collect()),
                        expires_at: None,
                    },
                );
                Ok(())
            }
        }
    }

    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, String>> {
        self.check_online()?;
        let mut entries = self.entries.lock();
        match Self::live_entry(&mut entries, key) {
            Some(entry) => match &entry.value {
                Value::Hash(hash) => Ok(hash.clone()),
                other => Err(Self::wrong_type(key, other, "hash")),
            },
            None => Ok(HashMap::new()),
        }
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> KvResult<i64> {
        self.check_online()?;
        let mut entries = self.entries.lock();
        let entry = match Self::live_entry(&mut entries, key) {
            Some(entry) => entry,
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Hash(HashMap::new()),
                        expires_at: None,
                    },
                );
                entries
                    .get_mut(key)
                    .ok_or_else(|| KvError::protocol("hash entry vanished during hincrby"))?
            }
        };
        let hash = match &mut entry.value {
            Value::Hash(hash) => hash,
            other => return Err(Self::wrong_type(key, other, "hash")),
        };
        let current = match hash.get(field) {
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                KvError::protocol(format!("hash field {field} at {key} is not an integer"))
            })?,
            None => 0,
        };
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> KvResult<bool> {
        self.check_online()?;
        let mut entries = self.entries.lock();
        let matches = matches!(
            Self::live_entry(&mut entries, key),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) if s.as_str() == token
        );
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_respects_existing_key() {
        let kv = MemoryKv::new();
        assert!(kv.set("k", "a", SetOptions::new().nx()).await.unwrap());
        assert!(!kv.set("k", "b", SetOptions::new().nx()).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn expired_key_reads_as_absent() {
        let kv = MemoryKv::new();
        kv.set("k", "v", SetOptions::new().ex(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
        // NX succeeds once the old value has expired.
        assert!(kv.set("k", "v2", SetOptions::new().nx()).await.unwrap());
    }

    #[tokio::test]
    async fn lrange_handles_negative_indices() {
        let kv = MemoryKv::new();
        let values: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        kv.rpush("l", &values).await.unwrap();
        assert_eq!(kv.lrange("l", 0, -1).await.unwrap(), values);
        assert_eq!(
            kv.lrange("l", -2, -1).await.unwrap(),
            vec!["c".to_string(), "d".to_string()]
        );
        assert_eq!(kv.lrange("l", 2, 1).await.unwrap(), Vec::<String>::new());
        assert_eq!(kv.lindex("l", 0).await.unwrap(), Some("a".to_string()));
        assert_eq!(kv.lindex("l", -1).await.unwrap(), Some("d".to_string()));
        assert_eq!(kv.lindex("l", 9).await.unwrap(), None);
    }

    #[tokio::test]
    async fn lrem_removes_from_requested_end() {
        let kv = MemoryKv::new();
        let values: Vec<String> = ["x", "y", "x", "x"].iter().map(|s| s.to_string()).collect();
        kv.rpush("l", &values).await.unwrap();
        assert_eq!(kv.lrem("l", 1, "x").await.unwrap(), 1);
        assert_eq!(
            kv.lrange("l", 0, -1).await.unwrap(),
            vec!["y".to_string(), "x".to_string(), "x".to_string()]
        );
        assert_eq!(kv.lrem("l", 0, "x").await.unwrap(), 2);
        assert_eq!(
            kv.lrange("l", 0, -1).await.unwrap(),
            vec!["y".to_string()]
        );
    }

    #[tokio::test]
    async fn set_ops_track_membership() {
        let kv = MemoryKv::new();
        let members: Vec<String> = ["a", "b", "a"].iter().map(|s| s.to_string()).collect();
        assert_eq!(kv.sadd("s", &members).await.unwrap(), 2);
        let mut all = kv.smembers("s").await.unwrap();
        all.sort();
        assert_eq!(all, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(kv.srem("s", &["a".to_string()]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn hincrby_starts_from_zero() {
        let kv = MemoryKv::new();
        assert_eq!(kv.hincrby("h", "n", 2).await.unwrap(), 2);
        assert_eq!(kv.hincrby("h", "n", 3).await.unwrap(), 5);
        assert_eq!(
            kv.hgetall("h").await.unwrap().get("n"),
            Some(&"5".to_string())
        );
    }

    #[tokio::test]
    async fn compare_and_delete_requires_matching_token() {
        let kv = MemoryKv::new();
        kv.set("lock", "token-a", SetOptions::new()).await.unwrap();
        assert!(!kv.compare_and_delete("lock", "token-b").await.unwrap());
        assert!(kv.exists("lock").await.unwrap());
        assert!(kv.compare_and_delete("lock", "token-a").await.unwrap());
        assert!(!kv.exists("lock").await.unwrap());
        // Double release is a no-op.
        assert!(!kv.compare_and_delete("lock", "token-a").await.unwrap());
    }

    #[tokio::test]
    async fn offline_store_reports_unavailable() {
        let kv = MemoryKv::new();
        kv.set_offline(true);
        let err = kv.get("k").await.unwrap_err();
        assert!(err.is_unavailable());
        kv.set_offline(false);
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn wrong_type_access_is_a_protocol_error() {
        let kv = MemoryKv::new();
        kv.rpush("l", &["a".to_string()]).await.unwrap();
        let err = kv.get("l").await.unwrap_err();
        assert!(matches!(err, KvError::Protocol { .. }));
    }
}
