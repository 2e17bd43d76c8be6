//! Failure taxonomy.
//!
//! Every way a stage attempt can go wrong is classified into a
//! [`FailureKind`] at the executor boundary. The retry/repair controller
//! decides what to do next purely from that classification.

use serde::{Deserialize, Serialize};

use super::error::PipelineError;

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed input; rejected before a run is created.
    InputValidation,
    /// Network or process-spawn trouble; retried verbatim.
    TransientInfrastructure,
    /// The stage ran but produced something unusable; eligible for repair.
    SemanticFailure,
    /// The repair collaborator had nothing to offer.
    RepairUnavailable,
    /// The attempt exceeded its timeout.
    Timeout,
    /// A bug in the orchestrator itself.
    InternalInvariantViolation,
    /// The run was cancelled between stages.
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InputValidation => "input_validation",
            FailureKind::TransientInfrastructure => "transient_infrastructure",
            FailureKind::SemanticFailure => "semantic_failure",
            FailureKind::RepairUnavailable => "repair_unavailable",
            FailureKind::Timeout => "timeout",
            FailureKind::InternalInvariantViolation => "internal_invariant_violation",
            FailureKind::Cancelled => "cancelled",
        }
    }

    /// Whether another attempt may follow a failure of this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::TransientInfrastructure
                | FailureKind::SemanticFailure
                | FailureKind::Timeout
        )
    }

    /// Whether this kind hands the failure to the repair collaborator.
    pub fn wants_repair(&self) -> bool {
        matches!(self, FailureKind::SemanticFailure)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure of one stage attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Paths (relative to the run workspace) written before the failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partial_artifacts: Vec<String>,
}

impl StageFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            partial_artifacts: Vec::new(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::TransientInfrastructure, message)
    }

    pub fn semantic(message: impl Into<String>) -> Self {
        Self::new(FailureKind::SemanticFailure, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InternalInvariantViolation, message)
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.partial_artifacts = artifacts;
        self
    }

    /// Same kind and message; partial artifacts are ignored.
    pub fn same_as(&self, other: &StageFailure) -> bool {
        self.kind == other.kind && self.message == other.message
    }
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<PipelineError> for StageFailure {
    fn from(err: PipelineError) -> Self {
        StageFailure::internal(err.to_string())
    }
}
