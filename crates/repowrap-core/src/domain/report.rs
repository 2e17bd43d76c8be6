//! Final report.
//!
//! The report is a pure function of the persisted run record, attempt records
//! and transitions. Computing it twice from the same records yields the same
//! value, which is what makes `rebuild_report` comparable to the stored copy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use repowrap_state::{RunId, RunRecord};

use super::context::StageOutput;
use super::failure::StageFailure;
use super::record::{RepairAction, StageRecord};
use super::run::{PipelineState, RunFailure, Transition};
use super::stage::{StageName, StageStatus};

pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::InProgress)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        })
    }
}

/// Per-stage roll-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: StageName,
    pub status: StageStatus,
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<StageFailure>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repairs: Vec<RepairAction>,
}

/// Where the run left its files, relative to the workspace directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLocations {
    pub workspace_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,
}

/// Read-only summary of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub schema_version: u32,
    pub run_id: RunId,
    pub locator: String,
    pub repo_name: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub repair_count: u32,
    pub artifacts: ArtifactLocations,
}

fn summarize_stage(
    stage: StageName,
    records: &[&StageRecord],
    failure: Option<&RunFailure>,
    terminal: bool,
) -> StageSummary {
    let repairs: Vec<RepairAction> = records
        .iter()
        .flat_map(|r| r.repairs_applied.iter().cloned())
        .collect();
    let last = records.last();
    let status = match last {
        None => StageStatus::Pending,
        Some(r) if r.succeeded() && repairs.is_empty() => StageStatus::Succeeded,
        Some(r) if r.succeeded() => StageStatus::Repaired,
        Some(_) if failure.is_some_and(|f| f.stage == stage) => StageStatus::Failed,
        Some(_) if terminal => StageStatus::Failed,
        Some(_) => StageStatus::Running,
    };
    StageSummary {
        stage,
        status,
        attempts: records.len() as u32,
        duration_ms: records.iter().map(|r| r.duration_ms).sum(),
        last_failure: last.and_then(|r| r.failure.clone()),
        repairs,
    }
}

impl FinalReport {
    /// Derive the report from stored records.
    pub fn compute(run: &RunRecord, records: &[StageRecord], transitions: &[Transition]) -> Self {
        let last = transitions.iter().max_by_key(|t| t.seq);
        let status = match last.map(|t| t.to) {
            Some(PipelineState::Completed) => RunStatus::Completed,
            Some(PipelineState::Failed) => RunStatus::Failed,
            _ => RunStatus::InProgress,
        };
        let failure = last.and_then(|t| t.failure.clone());
        let finished_at = if status.is_terminal() {
            last.map(|t| t.at)
        } else {
            None
        };

        let mut stages = Vec::with_capacity(StageName::ALL.len());
        for stage in StageName::ALL {
            let mut of_stage: Vec<&StageRecord> =
                records.iter().filter(|r| r.stage == stage).collect();
            of_stage.sort_by_key(|r| r.attempt);
            stages.push(summarize_stage(
                stage,
                &of_stage,
                failure.as_ref(),
                status.is_terminal(),
            ));
        }
        let repair_count = stages.iter().map(|s| s.repairs.len() as u32).sum();

        let mut artifacts = ArtifactLocations {
            workspace_dir: run.workspace_dir.clone(),
            ..Default::default()
        };
        for record in records.iter().filter(|r| r.succeeded()) {
            match &record.output {
                Some(StageOutput::Download(out)) => {
                    artifacts.source_dir = Some(out.source_dir.clone())
                }
                Some(StageOutput::Generate(out)) => {
                    artifacts.generated_dir = Some(out.generated_dir.clone())
                }
                Some(StageOutput::Finalize(out)) => {
                    artifacts.output_dir = Some(out.output_dir.clone());
                    artifacts.manifest = Some(out.manifest.clone());
                }
                _ => {}
            }
        }

        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            run_id: run.run_id.clone(),
            locator: run.locator.clone(),
            repo_name: run.repo_name.clone(),
            status,
            created_at: run.created_at,
            finished_at,
            stages,
            failure,
            repair_count,
            artifacts,
        }
    }

    pub fn stage(&self, stage: StageName) -> Option<&StageSummary> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Human-readable summary, one line per stage.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "run {} ({}) {}\n",
            self.run_id, self.repo_name, self.status
        ));
        out.push_str(&format!("locator: {}\n", self.locator));
        for s in &self.stages {
            let mut line = format!(
                "  {:<22} {:<10} attempts={}",
                s.stage.name(),
                format!("{:?}", s.status).to_lowercase(),
                s.attempts
            );
            if !s.repairs.is_empty() {
                line.push_str(&format!(" repairs={}", s.repairs.len()));
            }
            out.push_str(&line);
            out.push('\n');
        }
        if let Some(f) = &self.failure {
            out.push_str(&format!("failed at {}: {} ({})\n", f.stage, f.kind, f.message));
        }
        if let Some(dir) = &self.artifacts.output_dir {
            let path = std::path::Path::new(&self.artifacts.workspace_dir).join(dir);
            out.push_str(&format!("output: {}\n", path.display()));
        }
        out
    }
}
