use prepbank_kv::KvError;
use thiserror::Error;

/// Boxed error type carried by failed compute callbacks.
pub type ComputeError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the cache guards.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] KvError),

    /// The circuit breaker is open; the compute path was not attempted.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// The rate gate denied the compute path for this key.
    #[error("rate limit exceeded for {key}")]
    RateLimited {
        /// Cache key whose compute path was gated.
        key: String,
    },

    /// The per-key lock could not be acquired within the retry budget.
    #[error("could not acquire cache lock for {key} within the retry budget")]
    LockTimeout {
        /// Cache key whose lock stayed contended.
        key: String,
    },

    /// The caller-supplied compute callback failed. The original error is
    /// preserved as the source.
    #[error("compute callback failed: {0}")]
    Compute(#[source] ComputeError),

    /// A cached payload could not be (de)serialized.
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for cache guard operations.
pub type CacheResult<T> = Result<T, CacheError>;
