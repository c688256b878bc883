use crate::category::UnresolvedCategory;
use crate::reconciliation::Discrepancy;
use crate::types::CompletionId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum XpError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Rejected before anything was written.
    #[error("Validation failed for completion '{completion_id}': {reason}")]
    Validation {
        completion_id: CompletionId,
        reason: String,
    },

    #[error("Validation failed: {0}")]
    UnresolvedCategory(#[from] UnresolvedCategory),

    /// The ledger holds the completion but the aggregates were not updated.
    /// Retryable; the next award for the user or a reconciliation sweep
    /// brings the aggregates up to date.
    #[error("Completion '{completion_id}' recorded, aggregate update deferred: {reason}")]
    PartialAwardFailure {
        completion_id: CompletionId,
        reason: String,
    },

    #[error("Consistency error: {0}")]
    Consistency(#[from] Discrepancy),

    #[error("Aggregate store did not respond within {timeout_ms}ms")]
    StoreTimeout { timeout_ms: u64 },

    #[error("Aggregates for user '{user_id}' kept moving; gave up after {attempts} attempts")]
    CommitContention { user_id: String, attempts: u32 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl XpError {
    /// True for conditions the caller may retry without changing its input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            XpError::PartialAwardFailure { .. }
                | XpError::StoreTimeout { .. }
                | XpError::CommitContention { .. }
        )
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            XpError::Validation { .. } | XpError::UnresolvedCategory(_)
        )
    }
}

pub type XpResult<T> = Result<T, XpError>;
