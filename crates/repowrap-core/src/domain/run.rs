//! The run and its state machine.
//!
//! A [`Run`] moves through the fixed stage order one stage at a time. Every
//! move is an explicit call (`advance`, `fail`, `cancel`) that returns the
//! recorded [`Transition`]. Once the run is terminal nothing can change it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use repowrap_state::{RunId, TransitionRecord};

use super::context::{RunContext, StageOutput};
use super::error::{PipelineError, Result};
use super::failure::{FailureKind, StageFailure};
use super::locator::RepoLocator;
use super::record::StageRecord;
use super::stage::{StageName, StageStatus};

/// State-machine state: one per stage plus two terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PipelineState {
    Active(StageName),
    Completed,
    Failed,
}

impl PipelineState {
    pub fn initial() -> Self {
        PipelineState::Active(StageName::first())
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PipelineState::Active(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Active(stage) => stage.name(),
            PipelineState::Completed => "completed",
            PipelineState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PipelineState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "completed" => Ok(PipelineState::Completed),
            "failed" => Ok(PipelineState::Failed),
            other => other.parse().map(PipelineState::Active),
        }
    }
}

impl TryFrom<String> for PipelineState {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PipelineState> for String {
    fn from(state: PipelineState) -> Self {
        state.as_str().to_string()
    }
}

/// Why a run ended in `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    /// First stage that exhausted its budget (or did not start, when cancelled)
    pub stage: StageName,
    pub kind: FailureKind,
    pub message: String,
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub seq: u64,
    pub from: PipelineState,
    pub to: PipelineState,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TransitionDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure: Option<RunFailure>,
}

impl Transition {
    pub fn to_record(&self) -> Result<TransitionRecord> {
        Ok(TransitionRecord {
            seq: self.seq,
            from: self.from.to_string(),
            to: self.to.to_string(),
            timestamp: self.at,
            detail: serde_json::to_value(TransitionDetail {
                failure: self.failure.clone(),
            })?,
        })
    }

    pub fn from_record(record: &TransitionRecord) -> Result<Self> {
        let parse = |s: &str| {
            s.parse::<PipelineState>()
                .map_err(|e| PipelineError::Invariant(format!("transition {}: {e}", record.seq)))
        };
        let detail: TransitionDetail = if record.detail.is_null() {
            TransitionDetail::default()
        } else {
            serde_json::from_value(record.detail.clone())?
        };
        Ok(Self {
            seq: record.seq,
            from: parse(&record.from)?,
            to: parse(&record.to)?,
            at: record.timestamp,
            failure: detail.failure,
        })
    }
}

/// One end-to-end conversion of one repository.
#[derive(Debug, Clone)]
pub struct Run {
    pub id: RunId,
    pub locator: RepoLocator,
    pub created_at: DateTime<Utc>,
    state: PipelineState,
    stage_status: BTreeMap<StageName, StageStatus>,
    context: RunContext,
    records: Vec<StageRecord>,
    transitions: Vec<Transition>,
}

impl Run {
    pub fn new(id: RunId, locator: RepoLocator, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            locator,
            created_at,
            state: PipelineState::initial(),
            stage_status: StageName::ALL
                .iter()
                .map(|s| (*s, StageStatus::Pending))
                .collect(),
            context: RunContext::new(),
            records: Vec::new(),
            transitions: Vec::new(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn active_stage(&self) -> Option<StageName> {
        match self.state {
            PipelineState::Active(stage) => Some(stage),
            _ => None,
        }
    }

    pub fn stage_status(&self, stage: StageName) -> StageStatus {
        self.stage_status
            .get(&stage)
            .copied()
            .unwrap_or(StageStatus::Pending)
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn records(&self) -> &[StageRecord] {
        &self.records
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// The failure recorded by the terminal transition, if the run failed.
    pub fn failure(&self) -> Option<&RunFailure> {
        self.transitions.last().and_then(|t| t.failure.as_ref())
    }

    fn ensure_active(&self, stage: StageName, operation: &'static str) -> Result<()> {
        match self.state {
            PipelineState::Active(active) if active == stage => Ok(()),
            PipelineState::Active(active) => Err(PipelineError::StageMismatch {
                active: active.to_string(),
                got: stage,
            }),
            terminal => Err(PipelineError::InvalidState {
                run_id: self.id.to_string(),
                state: terminal.to_string(),
                operation,
            }),
        }
    }

    fn ensure_open(&self, operation: &'static str) -> Result<StageName> {
        self.active_stage().ok_or_else(|| PipelineError::InvalidState {
            run_id: self.id.to_string(),
            state: self.state.to_string(),
            operation,
        })
    }

    fn push_transition(&mut self, to: PipelineState, failure: Option<RunFailure>) -> Transition {
        let transition = Transition {
            seq: self.transitions.len() as u64 + 1,
            from: self.state,
            to,
            at: Utc::now(),
            failure,
        };
        self.state = to;
        self.transitions.push(transition.clone());
        transition
    }

    /// Mark the active stage as running.
    pub fn begin_stage(&mut self, stage: StageName) -> Result<()> {
        self.ensure_active(stage, "begin stage")?;
        self.stage_status.insert(stage, StageStatus::Running);
        Ok(())
    }

    /// Attach closed attempt records of the active stage.
    pub fn record_attempts(&mut self, stage: StageName, records: Vec<StageRecord>) -> Result<()> {
        self.ensure_active(stage, "record attempts")?;
        let mut last = self
            .records
            .iter()
            .filter(|r| r.stage == stage)
            .map(|r| r.attempt)
            .max()
            .unwrap_or(0);
        for record in &records {
            if record.stage != stage {
                return Err(PipelineError::StageMismatch {
                    active: stage.to_string(),
                    got: record.stage,
                });
            }
            if record.attempt <= last {
                return Err(PipelineError::Invariant(format!(
                    "attempt {} of {stage} does not follow attempt {last}",
                    record.attempt
                )));
            }
            last = record.attempt;
        }
        self.records.extend(records);
        Ok(())
    }

    /// Record the active stage's output and move to the next stage, or to
    /// `completed` after the last one.
    ///
    /// On error the run is left unchanged.
    pub fn advance(&mut self, output: StageOutput) -> Result<Transition> {
        let stage = output.stage();
        self.ensure_active(stage, "advance")?;
        let context = self.context.with_output(output)?;

        let repaired = self
            .records
            .iter()
            .any(|r| r.stage == stage && !r.repairs_applied.is_empty());
        let status = if repaired {
            StageStatus::Repaired
        } else {
            StageStatus::Succeeded
        };
        let next = match stage.next() {
            Some(next) => PipelineState::Active(next),
            None => PipelineState::Completed,
        };

        self.context = context;
        self.stage_status.insert(stage, status);
        Ok(self.push_transition(next, None))
    }

    /// Fail the run at the active stage.
    pub fn fail(&mut self, stage: StageName, failure: &StageFailure) -> Result<Transition> {
        self.ensure_active(stage, "fail")?;
        self.stage_status.insert(stage, StageStatus::Failed);
        Ok(self.push_transition(
            PipelineState::Failed,
            Some(RunFailure {
                stage,
                kind: failure.kind,
                message: failure.message.clone(),
            }),
        ))
    }

    /// Stop the run before the active stage starts.
    pub fn cancel(&mut self, reason: &str) -> Result<Transition> {
        let stage = self.ensure_open("cancel")?;
        Ok(self.push_transition(
            PipelineState::Failed,
            Some(RunFailure {
                stage,
                kind: FailureKind::Cancelled,
                message: reason.to_string(),
            }),
        ))
    }

    /// Abort the run after an orchestrator fault.
    pub fn abort(&mut self, message: &str) -> Result<Transition> {
        let stage = self.ensure_open("abort")?;
        self.stage_status.insert(stage, StageStatus::Failed);
        Ok(self.push_transition(
            PipelineState::Failed,
            Some(RunFailure {
                stage,
                kind: FailureKind::InternalInvariantViolation,
                message: message.to_string(),
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::context::{AnalysisOutput, DownloadOutput};

    fn run() -> Run {
        Run::new(
            "run-1".parse().unwrap(),
            RepoLocator::parse("octo/widget").unwrap(),
            Utc::now(),
        )
    }

    fn download() -> StageOutput {
        StageOutput::Download(DownloadOutput {
            commit_ref: "abc".into(),
            source_dir: "source".into(),
        })
    }

    #[test]
    fn test_initial_state() {
        let run = run();
        assert_eq!(run.state(), PipelineState::Active(StageName::Download));
        assert!(!run.is_terminal());
        for stage in StageName::ALL {
            assert_eq!(run.stage_status(stage), StageStatus::Pending);
        }
    }

    #[test]
    fn test_advance_moves_forward() {
        let mut run = run();
        let t = run.advance(download()).unwrap();
        assert_eq!(t.seq, 1);
        assert_eq!(t.from, PipelineState::Active(StageName::Download));
        assert_eq!(t.to, PipelineState::Active(StageName::Analyze));
        assert_eq!(run.stage_status(StageName::Download), StageStatus::Succeeded);
        assert!(run.context().contains(StageName::Download));
    }

    #[test]
    fn test_advance_rejects_wrong_stage_without_mutation() {
        let mut run = run();
        let out = StageOutput::Analyze(AnalysisOutput {
            capabilities: vec![],
            entry_points: vec!["main".into()],
            notes: None,
        });
        assert!(matches!(
            run.advance(out),
            Err(PipelineError::StageMismatch { .. })
        ));
        assert_eq!(run.state(), PipelineState::Active(StageName::Download));
        assert!(run.context().is_empty());
        assert!(run.transitions().is_empty());
    }

    #[test]
    fn test_terminal_run_rejects_everything() {
        let mut run = run();
        run.fail(StageName::Download, &StageFailure::transient("dns"))
            .unwrap();
        assert_eq!(run.state(), PipelineState::Failed);
        let before = run.transitions().len();

        assert!(matches!(
            run.advance(download()),
            Err(PipelineError::InvalidState { .. })
        ));
        assert!(run.cancel("late").is_err());
        assert!(run.begin_stage(StageName::Download).is_err());
        assert_eq!(run.transitions().len(), before);
        assert!(run.context().is_empty());
    }

    #[test]
    fn test_fail_records_failure() {
        let mut run = run();
        let t = run
            .fail(StageName::Download, &StageFailure::transient("dns"))
            .unwrap();
        let failure = t.failure.unwrap();
        assert_eq!(failure.stage, StageName::Download);
        assert_eq!(failure.kind, FailureKind::TransientInfrastructure);
        assert_eq!(run.stage_status(StageName::Download), StageStatus::Failed);
        assert_eq!(run.failure().unwrap().message, "dns");
    }

    #[test]
    fn test_cancel_names_stage_not_started() {
        let mut run = run();
        run.advance(download()).unwrap();
        let t = run.cancel("requested").unwrap();
        let failure = t.failure.unwrap();
        assert_eq!(failure.stage, StageName::Analyze);
        assert_eq!(failure.kind, FailureKind::Cancelled);
        assert_eq!(run.stage_status(StageName::Analyze), StageStatus::Pending);
    }

    #[test]
    fn test_record_attempts_enforces_monotonic() {
        let mut run = run();
        let rec = |n| {
            StageRecord::closed(
                StageName::Download,
                n,
                Utc::now(),
                Err(StageFailure::transient("x")),
                vec![],
            )
        };
        run.record_attempts(StageName::Download, vec![rec(1), rec(2)])
            .unwrap();
        assert!(run.record_attempts(StageName::Download, vec![rec(2)]).is_err());
        assert!(run
            .record_attempts(StageName::Analyze, vec![rec(3)])
            .is_err());
        assert_eq!(run.records().len(), 2);
    }

    #[test]
    fn test_pipeline_state_strings() {
        for stage in StageName::ALL {
            let state = PipelineState::Active(stage);
            assert_eq!(state.to_string().parse::<PipelineState>().unwrap(), state);
        }
        assert_eq!(
            "completed".parse::<PipelineState>().unwrap(),
            PipelineState::Completed
        );
        assert_eq!(
            serde_json::to_string(&PipelineState::Failed).unwrap(),
            "\"failed\""
        );
    }

    #[test]
    fn test_transition_record_conversion() {
        let mut run = run();
        let t = run
            .fail(StageName::Download, &StageFailure::transient("dns"))
            .unwrap();
        let record = t.to_record().unwrap();
        assert_eq!(record.from, "download");
        assert_eq!(record.to, "failed");
        assert_eq!(Transition::from_record(&record).unwrap(), t);
    }
}
