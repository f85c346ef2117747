//! Error types shared across the Kassa server.
//!
//! Every command reply carries one of these kinds so clients can branch on
//! the failure class instead of parsing messages. `Conflict` is special:
//! the engine retries the write envelope once before surfacing it.

use thiserror::Error;

/// Failure classes surfaced to command replies.
#[derive(Debug, Error)]
pub enum PosError {
    /// An identifier resolved to no entity.
    #[error("not found: {0}")]
    NotFound(String),

    /// A state-machine precondition was violated.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The session lacks the required capability.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Serialization conflict on the write envelope (SQLITE_BUSY).
    #[error("write conflict: {0}")]
    Conflict(String),

    /// Fiscal signer or log append failed before the business commit.
    /// Business state has been rolled back.
    #[error("fiscal commit failed: {0}")]
    FiscalCommitFailed(String),

    /// Fiscal event failed after the business commit. Business state
    /// stands; callers report this as a warning, never as a rollback.
    #[error("fiscal divergence: {0}")]
    FiscalDivergence(String),

    /// An outbound call (signer, embeddings, printer) exceeded its bound.
    #[error("external timeout: {0}")]
    ExternalTimeout(String),

    /// Reserved operation with no defined contract yet.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Malformed or inconsistent request payload.
    #[error("validation error: {0}")]
    Validation(String),

    /// Database failure that is not a serialization conflict.
    #[error("database error: {0}")]
    Database(String),

    /// Anything else (lock poisoning, serialization of internal state).
    #[error("internal error: {0}")]
    Internal(String),
}

impl PosError {
    /// Stable kind tag included in error replies.
    pub fn kind(&self) -> &'static str {
        match self {
            PosError::NotFound(_) => "NotFound",
            PosError::InvalidState(_) => "InvalidState",
            PosError::PermissionDenied(_) => "PermissionDenied",
            PosError::Conflict(_) => "Conflict",
            PosError::FiscalCommitFailed(_) => "FiscalCommitFailed",
            PosError::FiscalDivergence(_) => "FiscalDivergence",
            PosError::ExternalTimeout(_) => "ExternalTimeout",
            PosError::NotImplemented(_) => "NotImplemented",
            PosError::Validation(_) => "ValidationError",
            PosError::Database(_) => "DatabaseError",
            PosError::Internal(_) => "InternalError",
        }
    }

    /// Whether a retry of the whole envelope may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PosError::Conflict(_))
    }
}

impl From<rusqlite::Error> for PosError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref inner, _) = e {
            if inner.code == rusqlite::ErrorCode::DatabaseBusy
                || inner.code == rusqlite::ErrorCode::DatabaseLocked
            {
                return PosError::Conflict(e.to_string());
            }
        }
        if matches!(e, rusqlite::Error::QueryReturnedNoRows) {
            return PosError::NotFound("query returned no rows".into());
        }
        PosError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for PosError {
    fn from(e: serde_json::Error) -> Self {
        PosError::Validation(format!("invalid JSON payload: {e}"))
    }
}

impl From<reqwest::Error> for PosError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            PosError::ExternalTimeout(e.to_string())
        } else {
            PosError::Internal(e.to_string())
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for PosError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        PosError::Internal(format!("lock poisoned: {e}"))
    }
}

pub type PosResult<T> = Result<T, PosError>;

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        assert_eq!(PosError::NotFound("x".into()).kind(), "NotFound");
        assert_eq!(PosError::Validation("x".into()).kind(), "ValidationError");
        assert_eq!(PosError::Conflict("x".into()).kind(), "Conflict");
    }

    #[test]
    fn test_busy_maps_to_conflict() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        let err: PosError = busy.into();
        assert!(err.is_retryable());
        assert_eq!(err.kind(), "Conflict");
    }

    #[test]
    fn test_no_rows_maps_to_not_found() {
        let err: PosError = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(err.kind(), "NotFound");
    }
}
