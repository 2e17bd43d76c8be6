//! External collaborator contracts.
//!
//! The orchestrator treats source fetch, analysis, environment preparation,
//! generation, execution/validation and repair as black boxes behind async
//! traits. Each returns either a typed payload or a [`CollaboratorError`];
//! the stage executor classifies errors into the failure taxonomy.
//!
//! Implementations:
//! - [`git::GitSourceFetcher`]: `git clone` into the run workspace
//! - [`process::ProcessCollaborator`]: JSON over stdin/stdout of a command
//! - [`fakes::FakeCollaborators`]: scripted, in-memory (testing)

pub mod fakes;
pub mod git;
pub mod process;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{
    AnalysisOutput, EnvironmentDescriptor, FailureKind, GeneratedFile,
    RepairPatch, StageFailure, StageName, StageOutput, ValidationOutput,
};

/// Error kinds a collaborator can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaboratorErrorKind {
    /// Repository does not exist
    NotFound,
    /// Repository needs credentials
    AuthRequired,
    NetworkError,
    /// Could not start the collaborator process
    Spawn,
    /// Collaborator did not answer
    Unreachable,
    /// Answer did not have the expected shape
    InvalidResponse,
    /// Collaborator ran and reported that the work failed
    Rejected,
}

/// A failed collaborator call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct CollaboratorError {
    pub kind: CollaboratorErrorKind,
    pub message: String,
}

impl CollaboratorError {
    pub fn new(kind: CollaboratorErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(CollaboratorErrorKind::Rejected, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(CollaboratorErrorKind::NetworkError, message)
    }

    /// Map onto the orchestrator's failure taxonomy.
    pub fn classify(&self) -> FailureKind {
        match self.kind {
            CollaboratorErrorKind::NetworkError
            | CollaboratorErrorKind::Spawn
            | CollaboratorErrorKind::Unreachable => FailureKind::TransientInfrastructure,
            CollaboratorErrorKind::NotFound
            | CollaboratorErrorKind::AuthRequired
            | CollaboratorErrorKind::InvalidResponse
            | CollaboratorErrorKind::Rejected => FailureKind::SemanticFailure,
        }
    }

    pub fn into_failure(self) -> StageFailure {
        StageFailure::new(self.classify(), self.message)
    }
}

pub type CollaboratorResult<T> = std::result::Result<T, CollaboratorError>;

/// Read-only view of a run's cloned repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceSnapshot {
    pub repo_name: String,
    pub commit_ref: String,
    /// Absolute path of the clone
    pub source_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub analysis: AnalysisOutput,
    pub snapshot: WorkspaceSnapshot,
    /// Hints accumulated from repairs of earlier attempts
    #[serde(default)]
    pub repair_hints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub environment: EnvironmentDescriptor,
    pub files: Vec<GeneratedFile>,
    /// Absolute path the files were written to
    pub generated_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairRequest {
    pub stage: StageName,
    pub failure: StageFailure,
    /// Attempt that produced the failure
    pub attempt: u32,
    /// Outputs of the stages that precede `stage`
    pub context: BTreeMap<StageName, StageOutput>,
    /// The stage's current working file set, where it has one
    #[serde(default)]
    pub files: Vec<GeneratedFile>,
}

/// Answer of the repair collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RepairProposal {
    Patch { patch: RepairPatch },
    NoPatch,
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Clone `locator` into `destination`, returning the checked-out commit.
    async fn fetch(&self, locator: &str, destination: &Path) -> CollaboratorResult<String>;
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, snapshot: &WorkspaceSnapshot) -> CollaboratorResult<AnalysisOutput>;
}

#[async_trait]
pub trait EnvironmentPreparer: Send + Sync {
    async fn prepare(&self, snapshot: &WorkspaceSnapshot)
        -> CollaboratorResult<EnvironmentDescriptor>;
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> CollaboratorResult<Vec<GeneratedFile>>;
}

#[async_trait]
pub trait Validator: Send + Sync {
    async fn run_and_validate(
        &self,
        request: &ValidationRequest,
    ) -> CollaboratorResult<ValidationOutput>;
}

#[async_trait]
pub trait RepairAdvisor: Send + Sync {
    async fn propose_repair(&self, request: &RepairRequest) -> CollaboratorResult<RepairProposal>;
}

/// The full set of collaborators a run needs.
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn SourceFetcher>,
    pub analyzer: Arc<dyn Analyzer>,
    pub environment: Arc<dyn EnvironmentPreparer>,
    pub generator: Arc<dyn Generator>,
    pub validator: Arc<dyn Validator>,
    pub repair: Arc<dyn RepairAdvisor>,
}

impl Collaborators {
    /// Use one value for every role.
    pub fn uniform<T>(all: Arc<T>) -> Self
    where
        T: SourceFetcher
            + Analyzer
            + EnvironmentPreparer
            + Generator
            + Validator
            + RepairAdvisor
            + 'static,
    {
        Self {
            fetcher: all.clone(),
            analyzer: all.clone(),
            environment: all.clone(),
            generator: all.clone(),
            validator: all.clone(),
            repair: all,
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
