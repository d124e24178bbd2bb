//! Configuration for the cache-protection facade.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::breaker::CircuitBreakerConfig;

/// Rate gate tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateGateConfig {
    /// Maximum admitted requests per window.
    pub max_requests: u32,

    /// Sliding window length.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for RateGateConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
        }
    }
}

/// Configuration for [`crate::CacheProtection`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheProtectionConfig {
    /// Namespace prepended to every cache key (`{prefix}:{key}`).
    pub prefix: String,

    /// Default TTL for cached values.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// TTL for the null marker cached by the penetration guard. Kept short
    /// so a key that comes into existence is not hidden for long.
    #[serde(with = "humantime_serde")]
    pub null_ttl: Duration,

    /// TTL on the per-key compute lock. Bounds how long a crashed holder
    /// can stall other callers.
    #[serde(with = "humantime_serde")]
    pub lock_ttl: Duration,

    /// Initial delay between lock-acquisition attempts; doubles with jitter
    /// up to one second.
    #[serde(with = "humantime_serde")]
    pub lock_retry_delay: Duration,

    /// Attempt budget for the lock-retry loop. Exhaustion surfaces
    /// [`crate::CacheError::LockTimeout`].
    pub lock_max_attempts: u32,

    /// Optional circuit breaker wrapping the compute path.
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    /// Optional rate gate in front of the compute path.
    pub rate_gate: Option<RateGateConfig>,
}

impl Default for CacheProtectionConfig {
    fn default() -> Self {
        Self {
            prefix: "cache".to_string(),
            ttl: Duration::from_secs(3600),
            null_ttl: Duration::from_secs(300),
            lock_ttl: Duration::from_secs(10),
            lock_retry_delay: Duration::from_millis(100),
            lock_max_attempts: 50,
            circuit_breaker: None,
            rate_gate: None,
        }
    }
}

impl CacheProtectionConfig {
    /// Validate the configuration, returning a description of the first
    /// problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.prefix.is_empty() {
            return Err("cache prefix must not be empty".to_string());
        }
        if self.ttl.is_zero() || self.null_ttl.is_zero() {
            return Err("cache TTLs must be positive".to_string());
        }
        if self.lock_ttl.is_zero() {
            return Err("lock TTL must be positive".to_string());
        }
        if self.lock_max_attempts == 0 {
            return Err("lock retry budget must allow at least one attempt".to_string());
        }
        if let Some(breaker) = &self.circuit_breaker
            && breaker.failure_threshold == 0
        {
            return Err("circuit breaker failure threshold must be positive".to_string());
        }
        if let Some(rate) = &self.rate_gate {
            if rate.max_requests == 0 {
                return Err("rate gate request limit must be positive".to_string());
            }
            if rate.window.is_zero() {
                return Err("rate gate window must be positive".to_string());
            }
        }
        Ok(())
    }
}
