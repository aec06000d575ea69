//! Synchronizer error types.

use thiserror::Error;
use zkrep_ledger::{DecodeError, LedgerError};

use crate::source::SourceError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("synchronizer daemon is already running")]
    AlreadyRunning,

    #[error("event source error: {0}")]
    Source(#[from] SourceError),

    /// The contract emitted a log this build cannot decode.
    #[error("event schema mismatch: {0}")]
    Schema(DecodeError),

    #[error("ledger invariant violated: {0}")]
    Ledger(LedgerError),

    #[error("proof verifier unavailable: {0}")]
    Verifier(String),

    #[error("snapshot store error: {0}")]
    Store(#[from] StoreError),

    #[error("synchronizer shut down")]
    Shutdown,
}

impl From<LedgerError> for SyncError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Verifier(reason) => SyncError::Verifier(reason),
            other => SyncError::Ledger(other),
        }
    }
}

impl SyncError {
    /// Whether the daemon should back off and retry the same block range.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Source(_) | SyncError::Verifier(_) | SyncError::Store(_)
        )
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            SyncError::AlreadyRunning => "ALREADY_RUNNING",
            SyncError::Source(_) => "SOURCE_UNAVAILABLE",
            SyncError::Schema(_) => "SCHEMA_MISMATCH",
            SyncError::Ledger(err) => err.error_code(),
            SyncError::Verifier(_) => "VERIFIER_UNAVAILABLE",
            SyncError::Store(_) => "STORE_ERROR",
            SyncError::Shutdown => "SHUTDOWN",
        }
    }
}
