use prepbank_kv::KvError;
use thiserror::Error;

/// Errors from session-control operations.
///
/// Note that [`crate::ConcurrentSessionController::on_login`] never surfaces
/// these; the login path fails open. They reach callers only through the
/// direct management operations (list, revoke, prune).
#[derive(Debug, Error)]
pub enum SessionError {
    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] KvError),

    /// The session revoker failed to invalidate sessions at the source of
    /// truth.
    #[error("session revocation failed: {0}")]
    Revoke(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The per-user login lock stayed contended past the retry budget.
    #[error("could not acquire login lock for user {user_id} within the retry budget")]
    LockTimeout {
        /// User whose lock stayed contended.
        user_id: String,
    },
}

/// Result type for session-control operations.
pub type SessionResult<T> = Result<T, SessionError>;
