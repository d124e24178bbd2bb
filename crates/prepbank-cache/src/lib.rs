//! Cache-protection layer for PrepBank.
//!
//! Guards a shared key-value store against the classic thundering-herd
//! failure modes:
//!
//! - **Penetration** — repeated expensive lookups for keys that do not
//!   exist, countered by caching a null marker
//!   ([`CacheProtection::get_with_null_protection`]).
//! - **Breakdown** — a hot key expiring and every caller recomputing at
//!   once, countered by a per-key distributed lock with a double check
//!   ([`CacheProtection::get_with_double_check_lock`]).
//! - **Avalanche** — a batch of keys expiring together, countered by TTL
//!   jitter ([`CacheProtection::get_with_random_ttl`]), a circuit breaker
//!   ([`CacheProtection::get_with_circuit_breaker`]), or rate gating of the
//!   compute path ([`CacheProtection::get_with_rate_limit`]).
//!
//! ## Degradation policy
//!
//! The guards provide best-effort mutual exclusion, not linearizability.
//! Locks are advisory and TTL-bounded: a preempted holder may overlap the
//! next one, so a protected compute may run at most one extra time. The
//! rate gate fails open when the store is unreachable; compute failures are
//! logged and propagated.

pub mod breaker;
pub mod config;
pub mod error;
pub mod protection;
pub mod rate;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState};
pub use config::{CacheProtectionConfig, RateGateConfig};
pub use error::{CacheError, CacheResult, ComputeError};
pub use protection::CacheProtection;
pub use rate::{KvRateGate, LocalRateGate, RateGate, RateStatus};
