//! Stage records and repair actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use repowrap_state::{AttemptKey, AttemptRecord};

use super::context::{GeneratedFile, StageOutput};
use super::error::{PipelineError, Result};
use super::failure::{FailureKind, StageFailure};
use super::stage::StageName;

/// Lifecycle of one attempt: `pending -> running -> {succeeded, failed, timed_out}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl AttemptState {
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            AttemptState::Succeeded | AttemptState::Failed | AttemptState::TimedOut
        )
    }
}

/// A change proposed by the repair collaborator.
///
/// Patches only ever touch the repaired stage's own working inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairPatch {
    pub summary: String,
    /// Whole-file replacements, paths relative to the generated directory
    #[serde(default)]
    pub files: Vec<GeneratedFile>,
    /// Free-text guidance passed to the next attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// One automated fix applied to a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairAction {
    /// The failed attempt that triggered the repair
    pub triggered_by_attempt: u32,
    pub failure: StageFailure,
    pub patch: RepairPatch,
    /// Whether the attempt the patch was applied to succeeded
    pub rerun_succeeded: bool,
}

/// One closed attempt of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: StageName,
    pub attempt: u32,
    pub state: AttemptState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StageOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageFailure>,
    /// Repairs applied to this attempt's inputs before it ran
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repairs_applied: Vec<RepairAction>,
}

impl StageRecord {
    /// Close an attempt with its result.
    pub fn closed(
        stage: StageName,
        attempt: u32,
        started_at: DateTime<Utc>,
        result: std::result::Result<StageOutput, StageFailure>,
        repairs_applied: Vec<RepairAction>,
    ) -> Self {
        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        let succeeded = result.is_ok();
        let (state, output, failure) = match result {
            Ok(output) => (AttemptState::Succeeded, Some(output), None),
            Err(f) if f.kind == FailureKind::Timeout => (AttemptState::TimedOut, None, Some(f)),
            Err(f) => (AttemptState::Failed, None, Some(f)),
        };
        let repairs_applied = repairs_applied
            .into_iter()
            .map(|mut r| {
                r.rerun_succeeded = succeeded;
                r
            })
            .collect();
        Self {
            stage,
            attempt,
            state,
            started_at,
            finished_at,
            duration_ms,
            output,
            failure,
            repairs_applied,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == AttemptState::Succeeded
    }

    pub fn key(&self) -> AttemptKey {
        AttemptKey::new(self.stage.name(), self.stage.index(), self.attempt)
    }

    pub fn to_attempt_record(&self) -> Result<AttemptRecord> {
        Ok(AttemptRecord {
            key: self.key(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            succeeded: self.succeeded(),
            payload: serde_json::to_value(self)?,
        })
    }

    pub fn from_attempt_record(record: &AttemptRecord) -> Result<Self> {
        let parsed: StageRecord = serde_json::from_value(record.payload.clone())?;
        if parsed.key() != record.key {
            return Err(PipelineError::Invariant(format!(
                "attempt record {} holds payload for {}",
                record.key,
                parsed.key()
            )));
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::context::DownloadOutput;

    fn ok_output() -> StageOutput {
        StageOutput::Download(DownloadOutput {
            commit_ref: "deadbeef".into(),
            source_dir: "source".into(),
        })
    }

    #[test]
    fn test_closed_states() {
        let now = Utc::now();
        let ok = StageRecord::closed(StageName::Download, 1, now, Ok(ok_output()), vec![]);
        assert_eq!(ok.state, AttemptState::Succeeded);
        assert!(ok.output.is_some());
        assert!(ok.failure.is_none());

        let timed_out = StageRecord::closed(
            StageName::Download,
            2,
            now,
            Err(StageFailure::new(FailureKind::Timeout, "600s elapsed")),
            vec![],
        );
        assert_eq!(timed_out.state, AttemptState::TimedOut);
        assert!(timed_out.state.is_closed());

        let failed = StageRecord::closed(
            StageName::Download,
            3,
            now,
            Err(StageFailure::transient("connection reset")),
            vec![],
        );
        assert_eq!(failed.state, AttemptState::Failed);
        assert!(!failed.succeeded());
    }

    #[test]
    fn test_closed_marks_repair_outcome() {
        let action = RepairAction {
            triggered_by_attempt: 1,
            failure: StageFailure::semantic("ImportError"),
            patch: RepairPatch {
                summary: "fix import".into(),
                files: vec![],
                hint: None,
            },
            rerun_succeeded: false,
        };
        let rec = StageRecord::closed(
            StageName::Generate,
            2,
            Utc::now(),
            Err(StageFailure::semantic("still broken")),
            vec![action.clone()],
        );
        assert!(!rec.repairs_applied[0].rerun_succeeded);

        let rec = StageRecord::closed(
            StageName::Download,
            2,
            Utc::now(),
            Ok(ok_output()),
            vec![action],
        );
        assert!(rec.repairs_applied[0].rerun_succeeded);
    }

    #[test]
    fn test_attempt_record_conversion() {
        let rec = StageRecord::closed(StageName::Download, 1, Utc::now(), Ok(ok_output()), vec![]);
        let stored = rec.to_attempt_record().unwrap();
        assert_eq!(stored.key.stage, "download");
        assert_eq!(stored.key.stage_index, 0);
        assert!(stored.succeeded);
        let back = StageRecord::from_attempt_record(&stored).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_attempt_record_key_mismatch_detected() {
        let rec = StageRecord::closed(StageName::Download, 1, Utc::now(), Ok(ok_output()), vec![]);
        let mut stored = rec.to_attempt_record().unwrap();
        stored.key.attempt = 7;
        assert!(matches!(
            StageRecord::from_attempt_record(&stored),
            Err(PipelineError::Invariant(_))
        ));
    }
}
