//! Error types for repowrap-state

use thiserror::Error;

/// Errors that can occur in the artifact persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Run record does not exist
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// A record addressed by (run, stage, attempt) does not exist
    #[error("attempt not found: run {run_id} stage {stage} attempt {attempt}")]
    AttemptNotFound {
        run_id: String,
        stage: String,
        attempt: u32,
    },

    /// No final report has been written for the run
    #[error("report not found for run {run_id}")]
    ReportNotFound { run_id: String },

    /// Append-only violation: the record was already written
    #[error("record already exists: {what}")]
    AlreadyExists { what: String },

    /// Attempt numbers must be strictly increasing per stage
    #[error("attempt {attempt} for stage {stage} is not after attempt {last}")]
    NonMonotonicAttempt {
        stage: String,
        attempt: u32,
        last: u32,
    },

    /// Transition sequence numbers must be strictly increasing per run
    #[error("transition seq {seq} is not after {last}")]
    NonMonotonicTransition { seq: u64, last: u64 },

    /// The run already has a report and accepts no further writes
    #[error("run {run_id} is sealed; no further writes accepted")]
    RunSealed { run_id: String },

    /// Stored digest does not match the stored content
    #[error("digest mismatch for {what}: expected {expected}, got {actual}")]
    DigestMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    /// Malformed identifier or key
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
