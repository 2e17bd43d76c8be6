//! Orchestrator error types.
//!
//! Stage failures are values ([`super::StageFailure`]), not errors. The types
//! here cover faults of the orchestrator itself and input rejected at
//! submission.

use repowrap_state::StorageError;

use super::failure::FailureKind;
use super::stage::StageName;

/// Orchestrator-level faults.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("run {run_id} is {state}; cannot {operation}")]
    InvalidState {
        run_id: String,
        state: String,
        operation: &'static str,
    },

    #[error("output for stage {got} does not match active stage {active}")]
    StageMismatch { active: String, got: StageName },

    #[error("stage {reader} may not read output of {target}")]
    OrderViolation { reader: StageName, target: StageName },

    #[error("stage {stage} requires output of {missing}, which is not available")]
    MissingUpstream {
        stage: StageName,
        missing: StageName,
    },

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors returned by `submit`/`start` before a run exists, or when the run
/// could not be set up at all.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid repository locator {locator:?}: {reason}")]
    InvalidLocator { locator: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to set up run: {0}")]
    Setup(#[from] PipelineError),
}

impl SubmitError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SubmitError::InvalidLocator { .. } | SubmitError::InvalidConfig(_) => {
                FailureKind::InputValidation
            }
            SubmitError::Setup(_) => FailureKind::InternalInvariantViolation,
        }
    }

    pub fn is_validation(&self) -> bool {
        self.kind() == FailureKind::InputValidation
    }
}

impl From<StorageError> for SubmitError {
    fn from(err: StorageError) -> Self {
        SubmitError::Setup(PipelineError::Storage(err))
    }
}
