//! Extraction pipeline error types
//!
//! Record-level problems (`Validation`) are counted and skipped by the
//! orchestrator. Everything else ends the step: transient source errors are
//! retried first, all other variants are fatal for the job.

use thiserror::Error;
use uuid::Uuid;

use crate::finalizer::FinalizeStatus;
use crate::job::JobStatus;

/// Result type alias for extraction operations
pub type Result<T> = std::result::Result<T, ExtractError>;

#[derive(Error, Debug)]
pub enum ExtractError {
    /// Bad record content; the record is skipped and counted
    #[error("Validation error: {0}")]
    Validation(String),

    /// Connection loss, deadlock, lock timeout and friends; safe to retry
    #[error("Transient source error: {0}")]
    Transient(String),

    /// Malformed query, constraint violation, unreadable schema; never retried
    #[error("Source error: {0}")]
    Source(String),

    #[error("Source retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// Pagination correctness can no longer be guaranteed
    #[error("Data shape violation: {0}")]
    DataShape(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Write error: {0}")]
    Write(String),

    #[error("Skip limit exceeded: {skipped} records skipped, limit is {limit}")]
    SkipLimitExceeded { skipped: u64, limit: u64 },

    #[error("Illegal status transition {from} -> {to} for job {job_id}")]
    IllegalTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {job_id} is already in terminal state {status}")]
    TerminalState { job_id: Uuid, status: JobStatus },

    #[error("Concurrent modification of job {job_id} (expected version {expected_version})")]
    VersionConflict { job_id: Uuid, expected_version: i64 },

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Interface {0} already has a job in PROCESSING")]
    AlreadyRunning(String),

    #[error("Finalization failed ({status}): {reason}")]
    Finalize {
        status: FinalizeStatus,
        reason: String,
    },

    #[error("Content validation failed: {0}")]
    ContentInvalid(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] bif_common::BifError),
}

impl ExtractError {
    /// Whether the retry policy may attempt the operation again
    pub fn is_transient(&self) -> bool {
        matches!(self, ExtractError::Transient(_))
    }

    /// Record-level errors never abort a job on their own
    pub fn is_record_level(&self) -> bool {
        matches!(self, ExtractError::Validation(_))
    }

    pub fn config(message: impl Into<String>) -> Self {
        ExtractError::Config(message.into())
    }

    pub fn write(message: impl Into<String>) -> Self {
        ExtractError::Write(message.into())
    }

    pub fn data_shape(message: impl Into<String>) -> Self {
        ExtractError::DataShape(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(ExtractError::Transient("deadlock detected".into()).is_transient());
        assert!(!ExtractError::Source("syntax error".into()).is_transient());
        assert!(!ExtractError::data_shape("null key").is_transient());
        assert!(!ExtractError::RetriesExhausted {
            attempts: 3,
            last_error: "timeout".into()
        }
        .is_transient());
    }

    #[test]
    fn test_validation_is_record_level() {
        assert!(ExtractError::Validation("amount missing".into()).is_record_level());
        assert!(!ExtractError::write("disk full").is_record_level());
    }
}
