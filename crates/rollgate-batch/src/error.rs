//! Error types for batch runs.

use thiserror::Error;

/// Result type alias for batch operations.
pub type BatchResult<T> = Result<T, BatchError>;

#[derive(Debug, Error)]
pub enum BatchError {
    /// The operator (or the configured policy) aborted a stalled batch.
    /// `residual` holds the jobs that had not completed.
    #[error("batch aborted: {reason} ({} jobs left)", residual.len())]
    Aborted { residual: Vec<String>, reason: String },

    /// Job processes could not be counted on a host.
    #[error("process sampling failed: {0}")]
    Sampling(String),
}
