use thiserror::Error;

/// Errors returned by key-value store backends.
#[derive(Debug, Error)]
pub enum KvError {
    /// The backend could not be reached (network failure, pool exhausted,
    /// connection refused). Callers with an availability-first policy treat
    /// this as a signal to degrade, not to fail the request.
    #[error("key-value store unavailable: {message}")]
    Unavailable {
        /// Description of the underlying failure.
        message: String,
    },

    /// The backend answered but the operation itself failed (wrong value
    /// type at a key, malformed reply, script error).
    #[error("key-value store protocol error: {message}")]
    Protocol {
        /// Description of the protocol-level failure.
        message: String,
    },
}

impl KvError {
    /// Create a new Unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Create a new Protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Whether this error indicates the backend is down rather than a bad
    /// request. Fail-open paths only trigger on unavailability.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Result type for store operations.
pub type KvResult<T> = Result<T, KvError>;
