//! Stage payloads and the accumulating run context.
//!
//! Collaborator responses are validated once at the executor boundary and
//! stored as typed [`StageOutput`] variants. The [`RunContext`] maps each
//! stage to its last successful output and is only ever extended by
//! producing a new value.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::error::{PipelineError, Result};
use super::stage::StageName;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadOutput {
    /// Commit the snapshot was taken at
    pub commit_ref: String,
    /// Clone directory, relative to the run workspace
    pub source_dir: String,
}

/// One thing the analysis engine proposes to expose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisOutput {
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub entry_points: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl AnalysisOutput {
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty() && self.entry_points.is_empty()
    }
}

/// Description of a prepared execution environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentDescriptor {
    /// e.g. "venv", "conda", "system"
    pub kind: String,
    /// Command prefix used to run things inside the environment
    #[serde(default)]
    pub exec_prefix: Vec<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// A generated source file, path relative to the generated directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub files: Vec<GeneratedFile>,
    /// Directory the files were written to, relative to the run workspace
    pub generated_dir: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// Answer of the validation collaborator. Diagnostics are a soft outcome:
/// the call still succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutput {
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationOutput {
    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

/// Output of execute-and-validate: the diagnostics and the file set they
/// refer to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
    pub files: Vec<GeneratedFile>,
    /// Working directory the files were validated in
    pub work_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewOutput {
    /// True when validation reported nothing to review.
    pub clean_on_entry: bool,
    /// The reviewed file set handed to finalize
    pub files: Vec<GeneratedFile>,
    /// Diagnostics from validation that the review cleared
    #[serde(default)]
    pub resolved_diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeOutput {
    pub output_dir: String,
    pub written: Vec<String>,
    pub manifest: String,
}

/// Typed output of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageOutput {
    Download(DownloadOutput),
    Analyze(AnalysisOutput),
    PrepareEnvironment(EnvironmentDescriptor),
    Generate(GenerationOutput),
    ExecuteAndValidate(ExecutionOutput),
    ReviewAndRepair(ReviewOutput),
    Finalize(FinalizeOutput),
}

impl StageOutput {
    pub fn stage(&self) -> StageName {
        match self {
            StageOutput::Download(_) => StageName::Download,
            StageOutput::Analyze(_) => StageName::Analyze,
            StageOutput::PrepareEnvironment(_) => StageName::PrepareEnvironment,
            StageOutput::Generate(_) => StageName::Generate,
            StageOutput::ExecuteAndValidate(_) => StageName::ExecuteAndValidate,
            StageOutput::ReviewAndRepair(_) => StageName::ReviewAndRepair,
            StageOutput::Finalize(_) => StageName::Finalize,
        }
    }
}

/// Accumulated successful stage outputs of one run.
///
/// Cloning is cheap; entries are shared. Extending produces a new context and
/// leaves the original untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunContext {
    entries: BTreeMap<StageName, Arc<StageOutput>>,
}

macro_rules! typed_accessor {
    ($fn_name:ident, $variant:ident, $ty:ty) => {
        pub fn $fn_name(&self, reader: StageName) -> Result<&$ty> {
            match self.read(reader, StageName::$variant)? {
                StageOutput::$variant(out) => Ok(out),
                other => Err(PipelineError::Invariant(format!(
                    "context entry for {} holds {} output",
                    StageName::$variant,
                    other.stage()
                ))),
            }
        }
    };
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a new context with `output` recorded for its stage.
    ///
    /// Fails if the stage already has an entry.
    pub fn with_output(&self, output: StageOutput) -> Result<Self> {
        let stage = output.stage();
        if self.entries.contains_key(&stage) {
            return Err(PipelineError::Invariant(format!(
                "context already holds output for {stage}"
            )));
        }
        let mut entries = self.entries.clone();
        entries.insert(stage, Arc::new(output));
        Ok(Self { entries })
    }

    /// Read `target`'s output on behalf of `reader`.
    ///
    /// A stage may only read stages that precede it.
    pub fn read(&self, reader: StageName, target: StageName) -> Result<&StageOutput> {
        if target >= reader {
            return Err(PipelineError::OrderViolation { reader, target });
        }
        self.entries
            .get(&target)
            .map(Arc::as_ref)
            .ok_or(PipelineError::MissingUpstream {
                stage: reader,
                missing: target,
            })
    }

    /// Check that every input `stage` declares is present.
    pub fn check_preconditions(&self, stage: StageName) -> Result<()> {
        for required in stage.required_inputs() {
            self.read(stage, *required)?;
        }
        Ok(())
    }

    pub fn contains(&self, stage: StageName) -> bool {
        self.entries.contains_key(&stage)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stages with an entry, in pipeline order.
    pub fn stages(&self) -> Vec<StageName> {
        self.entries.keys().copied().collect()
    }

    /// Owned copy of the entries visible to `stage`.
    pub fn snapshot_before(&self, stage: StageName) -> BTreeMap<StageName, StageOutput> {
        self.entries
            .range(..stage)
            .map(|(k, v)| (*k, v.as_ref().clone()))
            .collect()
    }

    typed_accessor!(download, Download, DownloadOutput);
    typed_accessor!(analysis, Analyze, AnalysisOutput);
    typed_accessor!(environment, PrepareEnvironment, EnvironmentDescriptor);
    typed_accessor!(generation, Generate, GenerationOutput);
    typed_accessor!(execution, ExecuteAndValidate, ExecutionOutput);
    typed_accessor!(review, ReviewAndRepair, ReviewOutput);
}
