//! repowrap Core Library
//!
//! Drives a source repository through the fixed conversion pipeline and
//! reports how each stage went.

pub mod cancel;
pub mod collaborators;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod domain;
pub mod executor;
pub mod metrics;
pub mod obs;
pub mod pipeline;
pub mod telemetry;
pub mod workspace;

pub use cancel::{cancellation_pair, CancellationHandle, CancellationToken};

pub use collaborators::git::GitSourceFetcher;
pub use collaborators::process::ProcessCollaborator;
pub use collaborators::{
    Analyzer, CollaboratorError, CollaboratorErrorKind, CollaboratorResult, Collaborators,
    EnvironmentPreparer, GenerationRequest, Generator, RepairAdvisor, RepairProposal,
    RepairRequest, SourceFetcher, ValidationRequest, Validator, WorkspaceSnapshot,
};

pub use config::{
    CollaboratorCommands, CommandSpec, ConfigError, OrchestratorConfig, RunOptions, StagePolicy,
    StagePolicyOverride,
};

pub use controller::{RetryRepairController, StageOutcome, StageRun};
pub use coordinator::{RunCoordinator, RunHandle};
pub use executor::{AttemptInputs, AttemptRequest, StageExecutor};
pub use pipeline::PipelineDriver;
pub use workspace::RunWorkspace;

pub use domain::{
    FailureKind, FinalReport, PipelineError, PipelineState, RepairAction, RepairPatch,
    RepoLocator, Result, Run, RunStatus, StageFailure, StageName, StageOutput, StageRecord,
    StageStatus, SubmitError,
};

pub use metrics::METRICS;
pub use obs::{emit_run_finished, emit_run_started, RunSpan};
pub use telemetry::init_tracing;

/// repowrap version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
