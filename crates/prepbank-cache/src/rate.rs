//! Sliding-window admission control.
//!
//! Two deployments of the same contract:
//!
//! - [`LocalRateGate`] keeps windows in process memory. State is lost on
//!   restart and not shared across instances; fine for a single replica.
//! - [`KvRateGate`] keeps windows in the shared store so every replica
//!   enforces one logical limit. Required for horizontal scaling.
//!
//! Both fail open: when the backing store is unreachable the request is
//! admitted and a warning logged. A broken rate limit is preferable to
//! blocking all traffic.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;

use prepbank_kv::KvStore;

use crate::config::RateGateConfig;

/// Point-in-time view of one identifier's window.
#[derive(Debug, Clone)]
pub struct RateStatus {
    /// Requests admitted inside the current window.
    pub current: u32,
    /// Requests left before the gate denies.
    pub remaining: u32,
    /// Configured maximum per window.
    pub limit: u32,
    /// Approximate time the window resets. Reported as `now + window`, not
    /// recomputed from the oldest surviving entry; callers must not assume
    /// it is exact.
    pub reset_time: SystemTime,
}

/// Sliding-window rate gate keyed by an arbitrary identifier.
#[async_trait]
pub trait RateGate: Send + Sync {
    /// Admit or deny one request for `identifier`, recording it if admitted.
    async fn allow(&self, identifier: &str) -> bool;

    /// Forget all recorded requests for `identifier`.
    async fn reset(&self, identifier: &str);

    /// Current window occupancy for `identifier`.
    async fn status(&self, identifier: &str) -> RateStatus;
}

/// In-process rate gate.
pub struct LocalRateGate {
    config: RateGateConfig,
    windows: DashMap<String, Vec<Instant>>,
}

impl LocalRateGate {
    pub fn new(config: RateGateConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    fn pruned_len(&self, entries: &mut Vec<Instant>) -> usize {
        let window = self.config.window;
        entries.retain(|at| at.elapsed() < window);
        entries.len()
    }
}

#[async_trait]
impl RateGate for LocalRateGate {
    async fn allow(&self, identifier: &str) -> bool {
        let mut entries = self.windows.entry(identifier.to_string()).or_default();
        if self.pruned_len(entries.value_mut()) >= self.config.max_requests as usize {
            return false;
        }
        entries.push(Instant::now());
        true
    }

    async fn reset(&self, identifier: &str) {
        self.windows.remove(identifier);
    }

    async fn status(&self, identifier: &str) -> RateStatus {
        let current = match self.windows.get_mut(identifier) {
            Some(mut entries) => {
                let len = self.pruned_len(entries.value_mut());
                if len == 0 {
                    drop(entries);
                    self.windows.remove(identifier);
                }
                len as u32
            }
            None => 0,
        };
        self.config.status_for(current)
    }
}

/// Store-backed rate gate shared across service instances.
///
/// Each identifier maps to a list of admission timestamps (unix millis).
/// Entries older than the window are excluded from the count on read and
/// trimmed opportunistically; the key itself expires after two windows of
/// inactivity, so no background sweep is needed.
pub struct KvRateGate {
    store: Arc<dyn KvStore>,
    config: RateGateConfig,
}

/// List length that triggers an opportunistic rewrite dropping stale
/// timestamps, as a multiple of the request limit.
const TRIM_FACTOR: u64 = 4;

impl KvRateGate {
    pub fn new(store: Arc<dyn KvStore>, config: RateGateConfig) -> Self {
        Self { store, config }
    }

    fn now_millis() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
    }

    /// Timestamps still inside the window, oldest first.
    fn valid_entries(&self, raw: &[String]) -> Vec<String> {
        let cutoff = Self::now_millis().saturating_sub(self.config.window.as_millis());
        raw.iter()
            .filter(|ts| ts.parse::<u128>().map(|t| t >= cutoff).unwrap_or(false))
            .cloned()
            .collect()
    }

    async fn admit(&self, identifier: &str) -> prepbank_kv::KvResult<bool> {
        let raw = self.store.lrange(identifier, 0, -1).await?;
        let valid = self.valid_entries(&raw);
        if valid.len() >= self.config.max_requests as usize {
            return Ok(false);
        }
        // The list only grows, so rewrite it once stale entries dominate.
        // The rewrite is not atomic with concurrent pushes; losing a couple
        // of in-flight timestamps slightly loosens the limit, which is the
        // acceptable direction.
        if raw.len() as u64 > TRIM_FACTOR * self.config.max_requests as u64 {
            self.store.delete(identifier).await?;
            if !valid.is_empty() {
                self.store.rpush(identifier, &valid).await?;
            }
        }
        self.store
            .rpush(identifier, &[Self::now_millis().to_string()])
            .await?;
        self.store.expire(identifier, self.config.window * 2).await?;
        Ok(true)
    }
}

#[async_trait]
impl RateGate for KvRateGate {
    async fn allow(&self, identifier: &str) -> bool {
        match self.admit(identifier).await {
            Ok(admitted) => admitted,
            Err(e) => {
                tracing::warn!(identifier = %identifier, error = %e, "rate gate store error, failing open");
                true
            }
        }
    }

    async fn reset(&self, identifier: &str) {
        if let Err(e) = self.store.delete(identifier).await {
            tracing::warn!(identifier = %identifier, error = %e, "failed to reset rate gate window");
        }
    }

    async fn status(&self, identifier: &str) -> RateStatus {
        let current = match self.store.lrange(identifier, 0, -1).await {
            Ok(raw) => self.valid_entries(&raw).len() as u32,
            Err(e) => {
                tracing::warn!(identifier = %identifier, error = %e, "failed to read rate gate window");
                0
            }
        };
        self.config.status_for(current)
    }
}

impl RateGateConfig {
    fn status_for(&self, current: u32) -> RateStatus {
        RateStatus {
            current,
            remaining: self.max_requests.saturating_sub(current),
            limit: self.max_requests,
            reset_time: SystemTime::now() + self.window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prepbank_kv::MemoryKv;

    fn config(max: u32, window: Duration) -> RateGateConfig {
        RateGateConfig {
            max_requests: max,
            window,
        }
    }

    #[tokio::test]
    async fn local_gate_admits_up_to_limit() {
        let gate = LocalRateGate::new(config(3, Duration::from_secs(60)));
        for _ in 0..3 {
            assert!(gate.allow("user-1").await);
        }
        assert!(!gate.allow("user-1").await);
        // Other identifiers are unaffected.
        assert!(gate.allow("user-2").await);
    }

    #[tokio::test]
    async fn local_gate_window_slides() {
        let gate = LocalRateGate::new(config(2, Duration::from_millis(50)));
        assert!(gate.allow("id").await);
        assert!(gate.allow("id").await);
        assert!(!gate.allow("id").await);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(gate.allow("id").await);
    }

    #[tokio::test]
    async fn local_gate_reset_and_status() {
        let gate = LocalRateGate::new(config(5, Duration::from_secs(60)));
        gate.allow("id").await;
        gate.allow("id").await;
        let status = gate.status("id").await;
        assert_eq!(status.current, 2);
        assert_eq!(status.remaining, 3);
        assert_eq!(status.limit, 5);
        gate.reset("id").await;
        assert_eq!(gate.status("id").await.current, 0);
    }

    #[tokio::test]
    async fn kv_gate_shares_window_through_store() {
        let store = Arc::new(MemoryKv::new());
        let gate = KvRateGate::new(store.clone(), config(2, Duration::from_secs(60)));
        assert!(gate.allow("rate:q").await);
        assert!(gate.allow("rate:q").await);
        assert!(!gate.allow("rate:q").await);

        // A second gate over the same store sees the same window.
        let other = KvRateGate::new(store, config(2, Duration::from_secs(60)));
        assert!(!other.allow("rate:q").await);
    }

    #[tokio::test]
    async fn kv_gate_fails_open_when_store_is_down() {
        let store = Arc::new(MemoryKv::new());
        let gate = KvRateGate::new(store.clone(), config(1, Duration::from_secs(60)));
        assert!(gate.allow("rate:q").await);
        assert!(!gate.allow("rate:q").await);
        store.set_offline(true);
        assert!(gate.allow("rate:q").await);
    }

    #[tokio::test]
    async fn kv_gate_expired_entries_free_the_window() {
        let store = Arc::new(MemoryKv::new());
        let gate = KvRateGate::new(store, config(1, Duration::from_millis(40)));
        assert!(gate.allow("rate:q").await);
        assert!(!gate.allow("rate:q").await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(gate.allow("rate:q").await);
    }
}
