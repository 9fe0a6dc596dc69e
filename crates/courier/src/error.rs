//! Error types for the sync engine
//!
//! Library functions return `anyhow::Result`. The designed failures that
//! callers branch on are distinct types here, recovered with
//! `downcast_ref`. A finished run reports its outcome as [`SyncError`].

use crate::sync::SyncPhase;

/// The provider can no longer serve changes since the stored cursor
/// (Gmail history 404, Calendar 410 Gone).
#[derive(Debug, thiserror::Error)]
#[error("Cursor expired or too old for incremental sync")]
pub struct CursorExpiredError;

/// The user's refresh token is invalid or revoked
#[derive(Debug, thiserror::Error)]
#[error("Authorization expired for user {user_id}; account must be reconnected")]
pub struct AuthExpiredError {
    pub user_id: String,
}

/// A change record could not be applied
#[derive(Debug, thiserror::Error)]
#[error("Record {index} ({item_id}) could not be applied: {reason}")]
pub struct ReconcileError {
    /// Position of the record within its batch
    pub index: usize,
    pub item_id: String,
    pub reason: String,
}

/// Terminal failure of a sync run.
///
/// Every variant leaves the stored cursor untouched, so the whole run is
/// safe to retry from the start.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Authorization expired for {user_id}")]
    AuthExpired { user_id: String },

    #[error("Provider error during {phase}: {source}")]
    Transient {
        phase: SyncPhase,
        #[source]
        source: anyhow::Error,
    },

    #[error("Reconciliation failed: {source}")]
    Reconciliation {
        #[source]
        source: anyhow::Error,
    },

    #[error("Storage error during {phase}: {source}")]
    Storage {
        phase: SyncPhase,
        #[source]
        source: anyhow::Error,
    },

    #[error("Run exceeded its time budget during {phase}")]
    Timeout { phase: SyncPhase },
}

impl SyncError {
    /// Classify an error raised while talking to the provider
    pub fn from_provider(phase: SyncPhase, err: anyhow::Error) -> Self {
        if let Some(auth) = err.downcast_ref::<AuthExpiredError>() {
            return SyncError::AuthExpired {
                user_id: auth.user_id.clone(),
            };
        }
        if is_timeout(&err) {
            return SyncError::Timeout { phase };
        }
        SyncError::Transient { phase, source: err }
    }

    /// Whether the external runtime should retry the run
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SyncError::AuthExpired { .. })
    }

    /// Whether the user should be told about this failure
    pub fn is_user_actionable(&self) -> bool {
        matches!(self, SyncError::AuthExpired { .. })
    }
}

/// Whether an error chain bottoms out in an I/O or HTTP timeout
pub fn is_timeout(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return io.kind() == std::io::ErrorKind::TimedOut;
        }
        matches!(cause.downcast_ref::<ureq::Error>(), Some(ureq::Error::Timeout(_)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_auth_expired_is_not_retryable() {
        let err = SyncError::from_provider(
            SyncPhase::IncrementalSync,
            AuthExpiredError {
                user_id: "u1".into(),
            }
            .into(),
        );
        assert!(matches!(err, SyncError::AuthExpired { .. }));
        assert!(!err.is_retryable());
        assert!(err.is_user_actionable());
    }

    #[test]
    fn test_generic_provider_error_is_transient() {
        let err = SyncError::from_provider(SyncPhase::FullSync, anyhow!("503 from provider"));
        assert!(matches!(
            err,
            SyncError::Transient {
                phase: SyncPhase::FullSync,
                ..
            }
        ));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_io_timeout_is_detected() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline");
        let err = anyhow::Error::from(io).context("fetching history");
        assert!(is_timeout(&err));
        assert!(matches!(
            SyncError::from_provider(SyncPhase::IncrementalSync, err),
            SyncError::Timeout { .. }
        ));
    }
}
