//! Retry/repair controller.
//!
//! One bounded loop shared by every stage:
//! - transient and timeout failures are retried verbatim
//! - semantic failures on repairable stages consult the repair collaborator,
//!   and the patch it proposes feeds the next attempt
//! - anything else closes the stage
//!
//! Retries and repaired re-runs share one attempt counter per stage, and all
//! of them together stay inside the stage's wall-clock budget.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use repowrap_state::RunId;

use crate::collaborators::{RepairAdvisor, RepairProposal, RepairRequest};
use crate::config::StagePolicy;
use crate::domain::{
    FailureKind, GeneratedFile, PipelineError, RepairAction, RepairPatch, Result, RunContext,
    StageFailure, StageName, StageOutput, StageRecord,
};
use crate::executor::{AttemptInputs, AttemptRequest, StageExecutor};
use crate::metrics::METRICS;
use crate::obs;

/// How a stage ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// Output of the last (successful) attempt
    Succeeded(StageOutput),
    Failed(StageFailure),
}

/// All attempts of one stage plus its outcome.
#[derive(Debug, Clone)]
pub struct StageRun {
    pub stage: StageName,
    pub records: Vec<StageRecord>,
    pub outcome: StageOutcome,
}

impl StageRun {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, StageOutcome::Succeeded(_))
    }
}

pub struct RetryRepairController {
    run_id: RunId,
    executor: StageExecutor,
    repair: Arc<dyn RepairAdvisor>,
}

/// What to do after a failed attempt.
enum Next {
    Retry,
    Stop(StageFailure),
}

impl RetryRepairController {
    pub fn new(run_id: RunId, executor: StageExecutor, repair: Arc<dyn RepairAdvisor>) -> Self {
        Self {
            run_id,
            executor,
            repair,
        }
    }

    pub fn executor(&self) -> &StageExecutor {
        &self.executor
    }

    /// Run `stage` until it succeeds or its policy is exhausted.
    ///
    /// Every attempt is persisted by the executor before this returns.
    pub async fn run_stage(
        &self,
        stage: StageName,
        policy: StagePolicy,
        context: &RunContext,
    ) -> Result<StageRun> {
        let deadline = deadline_after(policy.stage_budget);
        let mut inputs = AttemptInputs::default();
        let mut records: Vec<StageRecord> = Vec::new();
        let mut attempt = 0u32;

        let failure = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break budget_exhausted(stage, policy.stage_budget, attempt);
            }
            attempt += 1;

            // Failure that triggered the repair now being tried, if any.
            let repaired_from = inputs.pending_repairs.last().map(|r| r.failure.clone());
            let record = self
                .executor
                .execute(AttemptRequest {
                    stage,
                    attempt,
                    context,
                    inputs: &inputs,
                    timeout: policy.attempt_timeout.min(remaining),
                })
                .await?;
            inputs.pending_repairs.clear();
            records.push(record.clone());

            let failure = match (record.output, record.failure) {
                (Some(output), _) => {
                    return Ok(StageRun {
                        stage,
                        records,
                        outcome: StageOutcome::Succeeded(output),
                    })
                }
                (None, Some(failure)) => failure,
                (None, None) => {
                    return Err(PipelineError::Invariant(format!(
                        "{stage} attempt {attempt} closed with neither output nor failure"
                    )))
                }
            };

            if repaired_from.is_some_and(|prev| prev.same_as(&failure)) {
                debug!(stage = %stage, attempt, "failure repeated after repair");
                break failure;
            }
            match self
                .after_failure(stage, attempt, &policy, deadline, failure, context, &mut inputs)
                .await
            {
                Next::Retry => continue,
                Next::Stop(failure) => break failure,
            }
        };

        Ok(StageRun {
            stage,
            records,
            outcome: StageOutcome::Failed(failure),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn after_failure(
        &self,
        stage: StageName,
        attempt: u32,
        policy: &StagePolicy,
        deadline: Instant,
        failure: StageFailure,
        context: &RunContext,
        inputs: &mut AttemptInputs,
    ) -> Next {
        if !failure.kind.is_retryable() || attempt >= policy.max_attempts {
            return Next::Stop(failure);
        }
        if !failure.kind.wants_repair() {
            return Next::Retry;
        }
        if !stage.is_repairable() {
            return Next::Stop(failure);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Next::Stop(failure);
        }

        let timeout = policy.attempt_timeout.min(remaining);
        match self
            .consult_repair(stage, attempt, &failure, context, inputs, timeout)
            .await
        {
            Ok(patch) => {
                obs::emit_repair_applied(self.run_id.as_str(), stage, attempt, &patch.summary);
                METRICS.inc_repairs();
                inputs.apply(RepairAction {
                    triggered_by_attempt: attempt,
                    failure,
                    patch,
                    rerun_succeeded: false,
                });
                Next::Retry
            }
            Err(reason) => {
                obs::emit_repair_unavailable(self.run_id.as_str(), stage, attempt, &reason);
                Next::Stop(StageFailure::new(
                    FailureKind::RepairUnavailable,
                    format!("{reason}; last failure: {}", failure.message),
                ))
            }
        }
    }

    async fn consult_repair(
        &self,
        stage: StageName,
        attempt: u32,
        failure: &StageFailure,
        context: &RunContext,
        inputs: &AttemptInputs,
        timeout: Duration,
    ) -> std::result::Result<RepairPatch, String> {
        let request = RepairRequest {
            stage,
            failure: failure.clone(),
            attempt,
            context: context.snapshot_before(stage),
            files: working_files(stage, context, inputs),
        };
        match tokio::time::timeout(timeout, self.repair.propose_repair(&request)).await {
            Ok(Ok(RepairProposal::Patch { patch })) => Ok(patch),
            Ok(Ok(RepairProposal::NoPatch)) => Err(format!("no repair proposed for {stage}")),
            Ok(Err(e)) => Err(format!("repair collaborator failed: {e}")),
            Err(_) => Err(format!(
                "repair collaborator exceeded {}s",
                timeout.as_secs_f64()
            )),
        }
    }
}

/// The file set the stage is currently working on.
fn working_files(stage: StageName, context: &RunContext, inputs: &AttemptInputs) -> Vec<GeneratedFile> {
    let base = match stage {
        StageName::ExecuteAndValidate => context.generation(stage).map(|g| g.files.clone()),
        StageName::ReviewAndRepair => context.execution(stage).map(|e| e.files.clone()),
        _ => Ok(Vec::new()),
    };
    inputs.overlay(&base.unwrap_or_default())
}

/// `now + budget`, clamped to roughly thirty years out.
fn deadline_after(budget: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(budget)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

fn budget_exhausted(stage: StageName, budget: Duration, attempts: u32) -> StageFailure {
    StageFailure::new(
        FailureKind::Timeout,
        format!(
            "{stage} exhausted its {}s budget after {attempts} attempt(s)",
            budget.as_secs_f64()
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::{sample_files, FakeCollaborators, Role};
    use crate::collaborators::{CollaboratorError, CollaboratorErrorKind, Collaborators};
    use crate::domain::{DownloadOutput, RepoLocator};
    use crate::workspace::RunWorkspace;
    use chrono::Utc;
    use repowrap_state::fakes::MemoryArtifactStore;
    use repowrap_state::{ArtifactStore, RunRecord};

    struct Harness {
        _tmp: tempfile::TempDir,
        controller: RetryRepairController,
    }

    async fn harness(collaborators: Collaborators) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let run_id: RunId = "run-ctl".parse().unwrap();
        let locator = RepoLocator::parse("octo/widget").unwrap();
        let workspace = RunWorkspace::create(tmp.path(), &run_id, None).await.unwrap();
        let store = Arc::new(MemoryArtifactStore::new());
        store
            .create_run(RunRecord {
                run_id: run_id.clone(),
                locator: locator.normalized.clone(),
                repo_name: locator.name.clone(),
                workspace_dir: workspace.root().display().to_string(),
                config: serde_json::json!({}),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let repair = collaborators.repair.clone();
        let executor =
            StageExecutor::new(run_id.clone(), locator, workspace, store, collaborators);
        Harness {
            _tmp: tmp,
            controller: RetryRepairController::new(run_id, executor, repair),
        }
    }

    fn policy(max_attempts: u32) -> StagePolicy {
        StagePolicy {
            max_attempts,
            attempt_timeout: Duration::from_secs(5),
            stage_budget: Duration::from_secs(60),
        }
    }

    fn upstream_of_generate() -> RunContext {
        RunContext::new()
            .with_output(StageOutput::Download(DownloadOutput {
                commit_ref: "abc".into(),
                source_dir: "source".into(),
            }))
            .unwrap()
            .with_output(StageOutput::Analyze(
                crate::collaborators::fakes::sample_analysis(),
            ))
            .unwrap()
    }

    fn patch(summary: &str) -> RepairProposal {
        RepairProposal::Patch {
            patch: RepairPatch {
                summary: summary.into(),
                files: vec![],
                hint: Some(summary.into()),
            },
        }
    }

    #[tokio::test]
    async fn test_transient_retried_without_repair() {
        let (fake, collaborators) = FakeCollaborators::happy()
            .script_fetch(vec![
                Err(CollaboratorError::network("connection reset")),
                Err(CollaboratorError::network("connection reset")),
            ])
            .into_collaborators();
        let h = harness(collaborators).await;

        let run = h
            .controller
            .run_stage(StageName::Download, policy(3), &RunContext::new())
            .await
            .unwrap();
        assert!(run.succeeded());
        assert_eq!(run.records.len(), 3);
        assert_eq!(fake.calls(Role::Fetch), 3);
        assert_eq!(fake.calls(Role::Repair), 0);
    }

    #[tokio::test]
    async fn test_unbounded_budget_does_not_overflow() {
        let (fake, collaborators) = FakeCollaborators::happy().into_collaborators();
        let h = harness(collaborators).await;
        let unbounded = StagePolicy {
            max_attempts: 3,
            attempt_timeout: Duration::MAX,
            stage_budget: Duration::MAX,
        };

        let run = h
            .controller
            .run_stage(StageName::Download, unbounded, &RunContext::new())
            .await
            .unwrap();
        assert!(run.succeeded());
        assert_eq!(fake.calls(Role::Fetch), 1);
    }

    #[tokio::test]
    async fn test_semantic_on_non_repairable_stage_stops() {
        let (fake, collaborators) = FakeCollaborators::happy()
            .script_fetch(vec![Err(CollaboratorError::new(
                CollaboratorErrorKind::NotFound,
                "repository not found",
            ))])
            .into_collaborators();
        let h = harness(collaborators).await;

        let run = h
            .controller
            .run_stage(StageName::Download, policy(3), &RunContext::new())
            .await
            .unwrap();
        assert_eq!(run.records.len(), 1);
        assert_eq!(fake.calls(Role::Repair), 0);
        match run.outcome {
            StageOutcome::Failed(f) => assert_eq!(f.kind, FailureKind::SemanticFailure),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_repair_hint_reaches_next_attempt() {
        let (fake, collaborators) = FakeCollaborators::happy()
            .script_generate(vec![Err(CollaboratorError::rejected("bad template"))])
            .script_repair(vec![Ok(patch("use the flask template"))])
            .into_collaborators();
        let h = harness(collaborators).await;

        let run = h
            .controller
            .run_stage(StageName::Generate, policy(3), &upstream_of_generate())
            .await
            .unwrap();
        assert!(run.succeeded());
        assert_eq!(run.records.len(), 2);
        assert!(run.records[0].repairs_applied.is_empty());
        let repair = &run.records[1].repairs_applied[0];
        assert_eq!(repair.triggered_by_attempt, 1);
        assert!(repair.rerun_succeeded);

        let requests = fake.generation_requests();
        assert!(requests[0].repair_hints.is_empty());
        assert_eq!(requests[1].repair_hints, vec!["use the flask template".to_string()]);
    }

    #[tokio::test]
    async fn test_no_patch_stops_early() {
        let (fake, collaborators) = FakeCollaborators::happy()
            .script_generate(vec![
                Err(CollaboratorError::rejected("syntax error on line 3")),
                Err(CollaboratorError::rejected("syntax error on line 9")),
            ])
            .script_repair(vec![Ok(patch("first try")), Ok(RepairProposal::NoPatch)])
            .into_collaborators();
        let h = harness(collaborators).await;

        let run = h
            .controller
            .run_stage(StageName::Generate, policy(3), &upstream_of_generate())
            .await
            .unwrap();
        assert_eq!(run.records.len(), 2);
        assert_eq!(fake.calls(Role::Repair), 2);
        match run.outcome {
            StageOutcome::Failed(f) => assert_eq!(f.kind, FailureKind::RepairUnavailable),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_identical_failure_after_repair_short_circuits() {
        let (fake, collaborators) = FakeCollaborators::happy()
            .fallback_generate(Err(CollaboratorError::rejected("same error")))
            .fallback_repair(Ok(patch("try again")))
            .into_collaborators();
        let h = harness(collaborators).await;

        let run = h
            .controller
            .run_stage(StageName::Generate, policy(5), &upstream_of_generate())
            .await
            .unwrap();
        assert_eq!(run.records.len(), 2);
        assert_eq!(fake.calls(Role::Repair), 1);
        assert!(!run.succeeded());
    }

    #[tokio::test]
    async fn test_last_attempt_does_not_consult_repair() {
        let (fake, collaborators) = FakeCollaborators::happy()
            .script_generate(vec![
                Err(CollaboratorError::rejected("error one")),
                Err(CollaboratorError::rejected("error two")),
            ])
            .fallback_repair(Ok(patch("patch")))
            .into_collaborators();
        let h = harness(collaborators).await;

        let run = h
            .controller
            .run_stage(StageName::Generate, policy(2), &upstream_of_generate())
            .await
            .unwrap();
        assert_eq!(run.records.len(), 2);
        assert_eq!(fake.calls(Role::Repair), 1);
        match run.outcome {
            StageOutcome::Failed(f) => {
                assert_eq!(f.kind, FailureKind::SemanticFailure);
                assert!(f.message.contains("error two"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stage_budget_bounds_attempts() {
        let (fake, collaborators) = FakeCollaborators::happy()
            .with_delay(Role::Fetch, Duration::from_secs(30))
            .into_collaborators();
        let h = harness(collaborators).await;
        let policy = StagePolicy {
            max_attempts: 10,
            attempt_timeout: Duration::from_millis(40),
            stage_budget: Duration::from_millis(100),
        };

        let run = h
            .controller
            .run_stage(StageName::Download, policy, &RunContext::new())
            .await
            .unwrap();
        assert!(run.records.len() < 10);
        assert_eq!(fake.calls(Role::Fetch) as usize, run.records.len());
        match run.outcome {
            StageOutcome::Failed(f) => assert_eq!(f.kind, FailureKind::Timeout),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_repair_request_carries_working_files() {
        let (fake, collaborators) = FakeCollaborators::happy()
            .script_validate(vec![Err(CollaboratorError::rejected("ImportError: flask"))])
            .script_repair(vec![Ok(patch("pin flask"))])
            .into_collaborators();
        let h = harness(collaborators).await;
        let generated = crate::domain::GenerationOutput {
            files: sample_files(),
            generated_dir: "generated".into(),
        };
        let ctx = upstream_of_generate()
            .with_output(StageOutput::PrepareEnvironment(
                crate::domain::EnvironmentDescriptor {
                    kind: "venv".into(),
                    exec_prefix: vec![],
                    details: serde_json::Value::Null,
                },
            ))
            .unwrap()
            .with_output(StageOutput::Generate(generated))
            .unwrap();

        let run = h
            .controller
            .run_stage(StageName::ExecuteAndValidate, policy(3), &ctx)
            .await
            .unwrap();
        assert!(run.succeeded());
        let requests = fake.repair_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].files, sample_files());
        assert!(requests[0].context.contains_key(&StageName::Generate));
        assert!(!requests[0].context.contains_key(&StageName::ExecuteAndValidate));
    }
}
