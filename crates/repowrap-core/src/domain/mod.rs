//! Domain models for repowrap.
//!
//! - `StageName`/`StageStatus`: the fixed pipeline and per-stage status
//! - `RunContext`: accumulated stage outputs
//! - `StageRecord`/`RepairAction`: closed attempts and their repairs
//! - `Run`: the stage state machine
//! - `FinalReport`: derived run summary

pub mod context;
pub mod error;
pub mod failure;
pub mod locator;
pub mod record;
pub mod report;
pub mod run;
pub mod stage;

pub use context::{
    AnalysisOutput, Capability, Diagnostic, DownloadOutput, EnvironmentDescriptor,
    ExecutionOutput, FinalizeOutput, GeneratedFile, GenerationOutput, ReviewOutput, RunContext,
    Severity, StageOutput, ValidationOutput,
};
pub use error::{PipelineError, Result, SubmitError};
pub use failure::{FailureKind, StageFailure};
pub use locator::{LocatorKind, RepoLocator};
pub use record::{AttemptState, RepairAction, RepairPatch, StageRecord};
pub use report::{ArtifactLocations, FinalReport, RunStatus, StageSummary};
pub use run::{PipelineState, Run, RunFailure, Transition};
pub use stage::{StageName, StageStatus};
