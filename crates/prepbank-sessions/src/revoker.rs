//! Session revocation seam.
//!
//! Evicting a device from the registry only removes coordination state in
//! the key-value store; the sessions themselves live in the relational
//! store owned by the host application. The controller calls this trait to
//! invalidate them at the source of truth.

use async_trait::async_trait;

/// Deletes session records in the authoritative session store.
///
/// # Implementations
///
/// The host application provides the real implementation (typically over
/// its SQL session table). [`NoopRevoker`] is available for tests and for
/// deployments where the key-value store is the only session store.
#[async_trait]
pub trait SessionRevoker: Send + Sync {
    /// Invalidate the given sessions. Must be a no-op on empty input and
    /// must tolerate ids that no longer exist.
    async fn revoke(
        &self,
        session_ids: &[String],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Revoker that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRevoker;

#[async_trait]
impl SessionRevoker for NoopRevoker {
    async fn revoke(
        &self,
        _session_ids: &[String],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}
