//! Read-through cache guards.
//!
//! Every operation works under `{prefix}:{key}` and reads through a
//! caller-supplied `compute` callback. The callback may legitimately
//! produce no value; that outcome is cached as a reserved null marker so
//! absent keys stop hitting the expensive compute path (cache penetration).
//!
//! The marker is never handed back to callers: a cached null deserializes
//! to `None`, indistinguishable from a fresh "does not exist" answer except
//! that it cost one store read instead of one compute.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;

use prepbank_kv::{KvStore, RetryBackoff, SetOptions, release_lock, try_acquire_lock};

use crate::breaker::{CircuitBreaker, CircuitError, CircuitState};
use crate::config::CacheProtectionConfig;
use crate::error::{CacheError, CacheResult, ComputeError};
use crate::rate::{KvRateGate, RateGate};

/// Sentinel cached when `compute` produced no value. Serialized payloads are
/// always valid JSON, which this deliberately is not, so a real value can
/// never alias it.
const NULL_MARKER: &str = "__null__";

/// Cache-protection facade over a shared key-value store.
///
/// One instance per cache namespace; cheap to share behind an `Arc`. The
/// circuit breaker and rate gate are constructed from the config and scoped
/// to this instance, never global.
pub struct CacheProtection {
    store: Arc<dyn KvStore>,
    config: CacheProtectionConfig,
    breaker: Option<CircuitBreaker>,
    rate_gate: Option<KvRateGate>,
}

impl CacheProtection {
    pub fn new(store: Arc<dyn KvStore>, config: CacheProtectionConfig) -> Self {
        let breaker = config.circuit_breaker.clone().map(CircuitBreaker::new);
        let rate_gate = config
            .rate_gate
            .clone()
            .map(|rc| KvRateGate::new(store.clone(), rc));
        Self {
            store,
            config,
            breaker,
            rate_gate,
        }
    }

    /// Penetration guard: on a miss the computed value is cached even when
    /// it is `None`, using a short TTL for the null marker so genuinely
    /// absent keys stop reaching `compute`.
    pub async fn get_with_null_protection<T, F, Fut>(
        &self,
        key: &str,
        compute: F,
    ) -> CacheResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, ComputeError>>,
    {
        let full_key = self.full_key(key);
        if let Some(hit) = self.read_cached(&full_key).await? {
            return Ok(hit);
        }
        let value = run_compute(key, compute).await?;
        self.write_value(&full_key, &value, self.config.ttl).await?;
        Ok(value)
    }

    /// Breakdown guard: at most one caller computes a missing key at a time,
    /// coordinated by a short-TTL per-key lock with a double check.
    pub async fn get_with_double_check_lock<T, F, Fut>(
        &self,
        key: &str,
        compute: F,
    ) -> CacheResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, ComputeError>>,
    {
        self.locked_read_through(key, self.config.ttl, compute)
            .await
    }

    /// Avalanche guard: like [`Self::get_with_double_check_lock`] but with a
    /// per-write TTL of `base_ttl ± jitter` (floored at one second), so a
    /// batch of keys written together does not expire together.
    pub async fn get_with_random_ttl<T, F, Fut>(
        &self,
        key: &str,
        base_ttl: Duration,
        jitter: Duration,
        compute: F,
    ) -> CacheResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, ComputeError>>,
    {
        self.locked_read_through(key, randomized_ttl(base_ttl, jitter), compute)
            .await
    }

    /// Avalanche guard: wraps the locked read-through in the configured
    /// circuit breaker. Behaves exactly like
    /// [`Self::get_with_double_check_lock`] when no breaker is configured.
    pub async fn get_with_circuit_breaker<T, F, Fut>(
        &self,
        key: &str,
        compute: F,
    ) -> CacheResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, ComputeError>>,
    {
        match &self.breaker {
            Some(breaker) => {
                match breaker
                    .execute(|| self.locked_read_through(key, self.config.ttl, compute))
                    .await
                {
                    Ok(value) => Ok(value),
                    Err(CircuitError::Open) => Err(CacheError::CircuitOpen),
                    Err(CircuitError::Inner(e)) => Err(e),
                }
            }
            None => {
                self.locked_read_through(key, self.config.ttl, compute)
                    .await
            }
        }
    }

    /// Avalanche guard: admits the request through the configured rate gate
    /// before touching the compute path. Denial fails with
    /// [`CacheError::RateLimited`]; this protects the downstream compute,
    /// not the cache reads themselves.
    pub async fn get_with_rate_limit<T, F, Fut>(
        &self,
        key: &str,
        compute: F,
    ) -> CacheResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, ComputeError>>,
    {
        if let Some(gate) = &self.rate_gate
            && !gate.allow(&self.rate_key(key)).await
        {
            return Err(CacheError::RateLimited {
                key: key.to_string(),
            });
        }
        self.locked_read_through(key, self.config.ttl, compute)
            .await
    }

    /// State of the configured circuit breaker, if any.
    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.breaker.as_ref().map(CircuitBreaker::state)
    }

    /// Clear the rate-gate window for `key`.
    pub async fn reset_rate_gate(&self, key: &str) {
        if let Some(gate) = &self.rate_gate {
            gate.reset(&self.rate_key(key)).await;
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.prefix, key)
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}:lock:{}", self.config.prefix, key)
    }

    fn rate_key(&self, key: &str) -> String {
        format!("{}:rate:{}", self.config.prefix, key)
    }

    /// Outer `None` is a miss; inner `None` is a cached null marker.
    async fn read_cached<T: DeserializeOwned>(
        &self,
        full_key: &str,
    ) -> CacheResult<Option<Option<T>>> {
        match self.store.get(full_key).await? {
            None => Ok(None),
            Some(raw) if raw == NULL_MARKER => {
                tracing::debug!(key = %full_key, "cache hit (null marker)");
                Ok(Some(None))
            }
            Some(raw) => {
                tracing::debug!(key = %full_key, "cache hit");
                Ok(Some(Some(serde_json::from_str(&raw)?)))
            }
        }
    }

    async fn write_value<T: Serialize>(
        &self,
        full_key: &str,
        value: &Option<T>,
        ttl: Duration,
    ) -> CacheResult<()> {
        match value {
            None => {
                self.store
                    .set(
                        full_key,
                        NULL_MARKER,
                        SetOptions::new().ex(self.config.null_ttl),
                    )
                    .await?;
            }
            Some(v) => {
                let raw = serde_json::to_string(v)?;
                self.store
                    .set(full_key, &raw, SetOptions::new().ex(ttl))
                    .await?;
            }
        }
        Ok(())
    }

    /// The double-check-lock read-through all compute-path guards delegate
    /// to.
    ///
    /// The loop re-checks the cache before every acquisition attempt, so a
    /// caller that lost the race returns the winner's value instead of
    /// recomputing. Retry is bounded; when the budget runs out the caller
    /// gets [`CacheError::LockTimeout`] rather than unbounded recursion.
    async fn locked_read_through<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> CacheResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, ComputeError>>,
    {
        let full_key = self.full_key(key);
        let lock_key = self.lock_key(key);
        let mut backoff =
            RetryBackoff::new(self.config.lock_retry_delay, self.config.lock_max_attempts);

        let token = loop {
            if let Some(hit) = self.read_cached::<T>(&full_key).await? {
                return Ok(hit);
            }
            if let Some(token) =
                try_acquire_lock(self.store.as_ref(), &lock_key, self.config.lock_ttl).await?
            {
                break token;
            }
            match backoff.next_delay() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    tracing::warn!(key = %key, "cache lock retry budget exhausted");
                    return Err(CacheError::LockTimeout {
                        key: key.to_string(),
                    });
                }
            }
        };

        // Second check under the lock: the previous holder may have written
        // the entry between our miss and this acquisition.
        let result = match self.read_cached::<T>(&full_key).await {
            Ok(Some(hit)) => Ok(hit),
            Ok(None) => match run_compute(key, compute).await {
                Ok(value) => self
                    .write_value(&full_key, &value, ttl)
                    .await
                    .map(|_| value),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        // Token-checked release: if our TTL lapsed and another holder took
        // over, this is a no-op instead of stealing their lock.
        if let Err(e) = release_lock(self.store.as_ref(), &lock_key, &token).await {
            tracing::warn!(key = %lock_key, error = %e, "failed to release cache lock");
        }
        result
    }
}

async fn run_compute<T, F, Fut>(key: &str, compute: F) -> CacheResult<Option<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Option<T>, ComputeError>>,
{
    match compute().await {
        Ok(value) => Ok(value),
        Err(e) => {
            tracing::error!(key = %key, error = %e, "compute callback failed");
            Err(CacheError::Compute(e))
        }
    }
}

fn randomized_ttl(base: Duration, jitter: Duration) -> Duration {
    let spread = jitter.as_secs() as i64;
    let offset = if spread == 0 {
        0
    } else {
        rand::thread_rng().gen_range(-spread..=spread)
    };
    Duration::from_secs((base.as_secs() as i64 + offset).max(1) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn randomized_ttl_stays_within_bounds() {
        let base = Duration::from_secs(100);
        let jitter = Duration::from_secs(30);
        for _ in 0..200 {
            let ttl = randomized_ttl(base, jitter);
            assert!(ttl >= Duration::from_secs(70));
            assert!(ttl <= Duration::from_secs(130));
        }
    }

    #[test]
    fn randomized_ttl_never_hits_zero() {
        let ttl = randomized_ttl(Duration::from_secs(2), Duration::from_secs(30));
        assert!(ttl >= Duration::from_secs(1));
    }

    #[test]
    fn null_marker_is_not_valid_json() {
        assert!(serde_json::from_str::<serde_json::Value>(NULL_MARKER).is_err());
    }
}
