//! Session-control configuration.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do when a login arrives from a new device while the user is at
/// the device cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnNewLogin {
    /// Evict the least recently registered device and admit the new one.
    #[default]
    KickOldest,
    /// Reject the login; the registry is left unchanged.
    Deny,
    /// Admit the new device; the device count may exceed the cap.
    Allow,
}

impl fmt::Display for OnNewLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OnNewLogin::KickOldest => "kick_oldest",
            OnNewLogin::Deny => "deny",
            OnNewLogin::Allow => "allow",
        };
        f.write_str(s)
    }
}

/// Concurrency policy for the session controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrentConfig {
    /// Key namespace for the device registry (`{prefix}:user:{id}:...`).
    pub prefix: String,

    /// Distinct devices a user may hold sessions on.
    pub max_devices: u32,

    /// Admission rule for a new device at the cap.
    pub on_new_login: OnNewLogin,

    /// Retention of the whole per-user registry; refreshed on every login.
    #[serde(with = "humantime_serde")]
    pub registry_ttl: Duration,

    /// TTL on the per-user login lock.
    #[serde(with = "humantime_serde")]
    pub lock_ttl: Duration,

    /// Initial delay between login-lock attempts; doubles with jitter.
    #[serde(with = "humantime_serde")]
    pub lock_retry_delay: Duration,

    /// Attempt budget for the login-lock retry loop.
    pub lock_max_attempts: u32,
}

impl Default for ConcurrentConfig {
    fn default() -> Self {
        Self {
            prefix: "sessions".to_string(),
            max_devices: 3,
            on_new_login: OnNewLogin::KickOldest,
            registry_ttl: Duration::from_secs(7 * 24 * 3600),
            lock_ttl: Duration::from_secs(5),
            lock_retry_delay: Duration::from_millis(100),
            lock_max_attempts: 20,
        }
    }
}

impl ConcurrentConfig {
    /// Validate the configuration, returning a description of the first
    /// problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.prefix.is_empty() {
            return Err("session prefix must not be empty".to_string());
        }
        if self.max_devices == 0 {
            return Err("max_devices must be at least 1".to_string());
        }
        if self.registry_ttl.is_zero() {
            return Err("registry TTL must be positive".to_string());
        }
        if self.lock_ttl.is_zero() {
            return Err("login lock TTL must be positive".to_string());
        }
        if self.lock_max_attempts == 0 {
            return Err("login lock retry budget must allow at least one attempt".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ConcurrentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_devices, 3);
        assert_eq!(config.on_new_login, OnNewLogin::KickOldest);
        assert_eq!(config.registry_ttl, Duration::from_secs(604_800));
    }

    #[test]
    fn strategy_display_matches_wire_names() {
        assert_eq!(OnNewLogin::KickOldest.to_string(), "kick_oldest");
        assert_eq!(OnNewLogin::Deny.to_string(), "deny");
        assert_eq!(OnNewLogin::Allow.to_string(), "allow");
    }

    #[test]
    fn rejects_zero_device_cap() {
        let config = ConcurrentConfig {
            max_devices: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
