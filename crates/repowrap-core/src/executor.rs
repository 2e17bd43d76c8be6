//! Stage executor: one attempt of one stage.
//!
//! Every attempt runs under a timeout with panics captured, so the caller
//! always gets a closed [`StageRecord`] whose failure (if any) is already
//! classified. The record is persisted before it is returned.
//!
//! Side effects stay inside the run's [`RunWorkspace`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tracing::warn;

use repowrap_state::{ArtifactStore, RunId};

use crate::collaborators::{
    CollaboratorError, Collaborators, GenerationRequest, ValidationRequest, WorkspaceSnapshot,
};
use crate::domain::{
    DownloadOutput, EnvironmentDescriptor, ExecutionOutput, FailureKind, FinalizeOutput,
    GeneratedFile, GenerationOutput, RepairAction, RepairPatch, RepoLocator, Result, ReviewOutput,
    RunContext, StageFailure, StageName, StageOutput, StageRecord, ValidationOutput,
};
use crate::metrics::METRICS;
use crate::obs;
use crate::workspace::{check_deliverable, RunWorkspace, MANIFEST_FILE};

type AttemptResult = std::result::Result<StageOutput, StageFailure>;

/// Working inputs of a stage, owned by the controller across attempts.
///
/// Repairs only ever change these; upstream outputs in the run context are
/// never touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptInputs {
    /// All patches proposed for this stage so far, oldest first
    pub patches: Vec<RepairPatch>,
    /// Repairs applied since the previous attempt; recorded on the next one
    pub pending_repairs: Vec<RepairAction>,
}

impl AttemptInputs {
    pub fn apply(&mut self, action: RepairAction) {
        self.patches.push(action.patch.clone());
        self.pending_repairs.push(action);
    }

    /// Overlay the accumulated patches on `base`, later patches winning.
    pub fn overlay(&self, base: &[GeneratedFile]) -> Vec<GeneratedFile> {
        let mut files = base.to_vec();
        for patch in &self.patches {
            for replacement in &patch.files {
                match files.iter_mut().find(|f| f.path == replacement.path) {
                    Some(existing) => existing.content = replacement.content.clone(),
                    None => files.push(replacement.clone()),
                }
            }
        }
        files
    }

    pub fn hints(&self) -> Vec<String> {
        self.patches.iter().filter_map(|p| p.hint.clone()).collect()
    }
}

/// One attempt to execute.
#[derive(Debug, Clone, Copy)]
pub struct AttemptRequest<'a> {
    pub stage: StageName,
    pub attempt: u32,
    pub context: &'a RunContext,
    pub inputs: &'a AttemptInputs,
    pub timeout: Duration,
}

/// Executes stage attempts for one run.
pub struct StageExecutor {
    run_id: RunId,
    locator: RepoLocator,
    workspace: RunWorkspace,
    store: Arc<dyn ArtifactStore>,
    collaborators: Collaborators,
}

fn io_failure(what: &str, err: std::io::Error) -> StageFailure {
    StageFailure::internal(format!("{what}: {err}"))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

fn log_line(record: &StageRecord) -> String {
    let mut line = format!(
        "{} attempt {} {:?} {}ms",
        record.finished_at.to_rfc3339(),
        record.attempt,
        record.state,
        record.duration_ms
    );
    if let Some(f) = &record.failure {
        line.push_str(&format!(" {}: {}", f.kind, f.message.replace('\n', " ")));
    }
    for repair in &record.repairs_applied {
        line.push_str(&format!(" [repair: {}]", repair.patch.summary));
    }
    line
}

fn remaining_diagnostics(out: &ValidationOutput) -> StageFailure {
    let first = out
        .diagnostics
        .first()
        .map(|d| d.message.as_str())
        .unwrap_or_default();
    StageFailure::semantic(format!(
        "{} diagnostic(s) remain: {first}",
        out.diagnostics.len()
    ))
}

impl StageExecutor {
    pub fn new(
        run_id: RunId,
        locator: RepoLocator,
        workspace: RunWorkspace,
        store: Arc<dyn ArtifactStore>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            run_id,
            locator,
            workspace,
            store,
            collaborators,
        }
    }

    pub fn workspace(&self) -> &RunWorkspace {
        &self.workspace
    }

    /// Run one attempt and persist its closed record.
    ///
    /// Stage failures are returned inside the record. `Err` means the record
    /// could not be persisted.
    pub async fn execute(&self, request: AttemptRequest<'_>) -> Result<StageRecord> {
        let started_at = Utc::now();
        METRICS.inc_stage_attempts();

        let result = match request.context.check_preconditions(request.stage) {
            Err(e) => Err(StageFailure::from(e)),
            Ok(()) => self.run_guarded(&request).await,
        };
        if matches!(&result, Err(f) if f.kind == FailureKind::Timeout) {
            METRICS.inc_timeouts();
        }

        let record = StageRecord::closed(
            request.stage,
            request.attempt,
            started_at,
            result,
            request.inputs.pending_repairs.clone(),
        );
        self.store
            .append_attempt(&self.run_id, record.to_attempt_record()?)
            .await?;
        obs::emit_attempt_closed(self.run_id.as_str(), &record);
        if let Err(e) = self
            .workspace
            .append_log(record.stage, &log_line(&record))
            .await
        {
            warn!(
                run_id = %self.run_id,
                stage = %record.stage,
                error = %e,
                "stage log not written"
            );
        }
        Ok(record)
    }

    async fn run_guarded(&self, request: &AttemptRequest<'_>) -> AttemptResult {
        let guarded = AssertUnwindSafe(self.perform(request)).catch_unwind();
        match tokio::time::timeout(request.timeout, guarded).await {
            Err(_) => Err(StageFailure::new(
                FailureKind::Timeout,
                format!(
                    "{} attempt {} exceeded {}s",
                    request.stage,
                    request.attempt,
                    request.timeout.as_secs_f64()
                ),
            )),
            Ok(Err(panic)) => Err(StageFailure::internal(format!(
                "{} attempt {} panicked: {}",
                request.stage,
                request.attempt,
                panic_message(panic.as_ref())
            ))),
            Ok(Ok(result)) => result,
        }
    }

    fn snapshot(&self, context: &RunContext, reader: StageName) -> Result<WorkspaceSnapshot> {
        let download = context.download(reader)?;
        Ok(WorkspaceSnapshot {
            repo_name: self.locator.name.clone(),
            commit_ref: download.commit_ref.clone(),
            source_dir: self.workspace.source_dir(),
        })
    }

    async fn perform(&self, request: &AttemptRequest<'_>) -> AttemptResult {
        let ctx = request.context;
        let stage = request.stage;
        match stage {
            StageName::Download => self.download().await,
            StageName::Analyze => {
                let snapshot = self.snapshot(ctx, stage)?;
                let analysis = self
                    .collaborators
                    .analyzer
                    .analyze(&snapshot)
                    .await
                    .map_err(CollaboratorError::into_failure)?;
                if analysis.is_empty() {
                    return Err(StageFailure::semantic(
                        "analysis found no capabilities or entry points",
                    ));
                }
                Ok(StageOutput::Analyze(analysis))
            }
            StageName::PrepareEnvironment => {
                let snapshot = self.snapshot(ctx, stage)?;
                let env = self
                    .collaborators
                    .environment
                    .prepare(&snapshot)
                    .await
                    .map_err(CollaboratorError::into_failure)?;
                Ok(StageOutput::PrepareEnvironment(env))
            }
            StageName::Generate => self.generate(ctx, request.inputs).await,
            StageName::ExecuteAndValidate => {
                let env = ctx.environment(stage)?;
                let generated = ctx.generation(stage)?;
                let files = request.inputs.overlay(&generated.files);
                let (out, work_dir) = self.validate_working_copy(stage, env, &files).await?;
                Ok(StageOutput::ExecuteAndValidate(ExecutionOutput {
                    diagnostics: out.diagnostics,
                    files,
                    work_dir,
                }))
            }
            StageName::ReviewAndRepair => {
                let execution = ctx.execution(stage)?;
                if execution.diagnostics.is_empty() && request.inputs.patches.is_empty() {
                    return Ok(StageOutput::ReviewAndRepair(ReviewOutput {
                        clean_on_entry: true,
                        files: execution.files.clone(),
                        resolved_diagnostics: vec![],
                    }));
                }
                let env = ctx.environment(stage)?;
                let files = request.inputs.overlay(&execution.files);
                let (out, _) = self.validate_working_copy(stage, env, &files).await?;
                if !out.is_clean() {
                    return Err(remaining_diagnostics(&out));
                }
                Ok(StageOutput::ReviewAndRepair(ReviewOutput {
                    clean_on_entry: false,
                    files,
                    resolved_diagnostics: execution.diagnostics.clone(),
                }))
            }
            StageName::Finalize => self.finalize(ctx).await,
        }
    }

    async fn download(&self) -> AttemptResult {
        let source = self.workspace.source_dir();
        // A failed clone may leave a partial checkout behind.
        self.workspace
            .fresh_dir(&source)
            .await
            .map_err(|e| io_failure("failed to reset source directory", e))?;
        let commit_ref = self
            .collaborators
            .fetcher
            .fetch(&self.locator.normalized, &source)
            .await
            .map_err(CollaboratorError::into_failure)?;
        Ok(StageOutput::Download(DownloadOutput {
            commit_ref,
            source_dir: self.workspace.display_path(&source),
        }))
    }

    async fn generate(&self, ctx: &RunContext, inputs: &AttemptInputs) -> AttemptResult {
        let stage = StageName::Generate;
        let request = GenerationRequest {
            analysis: ctx.analysis(stage)?.clone(),
            snapshot: self.snapshot(ctx, stage)?,
            repair_hints: inputs.hints(),
        };
        let generated = self
            .collaborators
            .generator
            .generate(&request)
            .await
            .map_err(CollaboratorError::into_failure)?;
        let files = inputs.overlay(&generated);
        if files.is_empty() {
            return Err(StageFailure::semantic("generation produced no files"));
        }
        check_deliverable(&files)?;

        let dir = self.workspace.generated_dir();
        self.workspace
            .fresh_dir(&dir)
            .await
            .map_err(|e| io_failure("failed to reset generated directory", e))?;
        self.workspace.write_files(&dir, &files).await?;
        Ok(StageOutput::Generate(GenerationOutput {
            files,
            generated_dir: self.workspace.display_path(&dir),
        }))
    }

    async fn validate_working_copy(
        &self,
        stage: StageName,
        environment: &EnvironmentDescriptor,
        files: &[GeneratedFile],
    ) -> std::result::Result<(ValidationOutput, String), StageFailure> {
        check_deliverable(files)?;
        let dir = self.workspace.work_dir(stage);
        self.workspace
            .fresh_dir(&dir)
            .await
            .map_err(|e| io_failure("failed to reset working directory", e))?;
        self.workspace.write_files(&dir, files).await?;

        let request = ValidationRequest {
            environment: environment.clone(),
            files: files.to_vec(),
            generated_dir: dir.clone(),
        };
        let out = self
            .collaborators
            .validator
            .run_and_validate(&request)
            .await
            .map_err(CollaboratorError::into_failure)?;
        Ok((out, self.workspace.display_path(&dir)))
    }

    async fn finalize(&self, ctx: &RunContext) -> AttemptResult {
        let stage = StageName::Finalize;
        let review = ctx.review(stage)?;
        let commit_ref = ctx.download(stage)?.commit_ref.clone();
        check_deliverable(&review.files)?;
        let output = self.workspace.output_dir().to_path_buf();
        self.workspace
            .fresh_dir(&output)
            .await
            .map_err(|e| io_failure("failed to reset output directory", e))?;
        let written = self.workspace.write_files(&output, &review.files).await?;

        let manifest = serde_json::json!({
            "run_id": self.run_id,
            "repository": self.locator.normalized,
            "repo_name": self.locator.name,
            "commit_ref": commit_ref,
            "files": review.files.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(),
        });
        let manifest_path = output.join(MANIFEST_FILE);
        let bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| StageFailure::internal(format!("failed to encode manifest: {e}")))?;
        tokio::fs::write(&manifest_path, bytes).await.map_err(|e| {
            io_failure("failed to write manifest", e).with_artifacts(written.clone())
        })?;

        Ok(StageOutput::Finalize(FinalizeOutput {
            output_dir: self.workspace.display_path(&output),
            written,
            manifest: self.workspace.display_path(&manifest_path),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::{sample_files, FakeCollaborators, Role};
    use crate::collaborators::{Analyzer, CollaboratorResult};
    use crate::domain::{AnalysisOutput, AttemptState};
    use async_trait::async_trait;
    use repowrap_state::fakes::MemoryArtifactStore;
    use repowrap_state::RunRecord;

    struct Harness {
        _tmp: tempfile::TempDir,
        store: Arc<MemoryArtifactStore>,
        executor: StageExecutor,
    }

    async fn harness(collaborators: Collaborators) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let run_id: RunId = "run-x".parse().unwrap();
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
        let executor = StageExecutor::new(run_id, locator, workspace, store.clone(), collaborators);
        Harness {
            _tmp: tmp,
            store,
            executor,
        }
    }

    fn request<'a>(
        stage: StageName,
        attempt: u32,
        context: &'a RunContext,
        inputs: &'a AttemptInputs,
    ) -> AttemptRequest<'a> {
        AttemptRequest {
            stage,
            attempt,
            context,
            inputs,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_download_persists_record() {
        let (_fake, collaborators) = FakeCollaborators::happy().into_collaborators();
        let h = harness(collaborators).await;
        let ctx = RunContext::new();
        let inputs = AttemptInputs::default();

        let record = h
            .executor
            .execute(request(StageName::Download, 1, &ctx, &inputs))
            .await
            .unwrap();
        assert_eq!(record.state, AttemptState::Succeeded);
        match record.output.as_ref().unwrap() {
            StageOutput::Download(out) => assert_eq!(out.source_dir, "source"),
            other => panic!("unexpected output {other:?}"),
        }

        let stored = h
            .store
            .get_attempt(&"run-x".parse().unwrap(), "download", 1)
            .await
            .unwrap();
        assert!(stored.succeeded);
        assert_eq!(StageRecord::from_attempt_record(&stored).unwrap(), record);
    }

    #[tokio::test]
    async fn test_missing_upstream_is_internal_failure() {
        let (fake, collaborators) = FakeCollaborators::happy().into_collaborators();
        let h = harness(collaborators).await;
        let ctx = RunContext::new();
        let inputs = AttemptInputs::default();

        let record = h
            .executor
            .execute(request(StageName::Generate, 1, &ctx, &inputs))
            .await
            .unwrap();
        let failure = record.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::InternalInvariantViolation);
        assert_eq!(fake.calls(Role::Generate), 0);
    }

    #[tokio::test]
    async fn test_timeout_is_classified() {
        let (_fake, collaborators) = FakeCollaborators::happy()
            .with_delay(Role::Fetch, Duration::from_secs(30))
            .into_collaborators();
        let h = harness(collaborators).await;
        let ctx = RunContext::new();
        let inputs = AttemptInputs::default();
        let mut req = request(StageName::Download, 1, &ctx, &inputs);
        req.timeout = Duration::from_millis(50);

        let record = h.executor.execute(req).await.unwrap();
        assert_eq!(record.state, AttemptState::TimedOut);
        assert_eq!(record.failure.unwrap().kind, FailureKind::Timeout);
    }

    struct PanickingAnalyzer;

    #[async_trait]
    impl Analyzer for PanickingAnalyzer {
        async fn analyze(&self, _s: &WorkspaceSnapshot) -> CollaboratorResult<AnalysisOutput> {
            panic!("analyzer exploded");
        }
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let (_fake, mut collaborators) = FakeCollaborators::happy().into_collaborators();
        collaborators.analyzer = Arc::new(PanickingAnalyzer);
        let h = harness(collaborators).await;
        let ctx = RunContext::new()
            .with_output(StageOutput::Download(DownloadOutput {
                commit_ref: "abc".into(),
                source_dir: "source".into(),
            }))
            .unwrap();
        let inputs = AttemptInputs::default();

        let record = h
            .executor
            .execute(request(StageName::Analyze, 1, &ctx, &inputs))
            .await
            .unwrap();
        let failure = record.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::InternalInvariantViolation);
        assert!(failure.message.contains("analyzer exploded"));
    }

    #[tokio::test]
    async fn test_empty_analysis_is_semantic() {
        let (_fake, collaborators) = FakeCollaborators::happy()
            .script_analyze(vec![Ok(AnalysisOutput {
                capabilities: vec![],
                entry_points: vec![],
                notes: None,
            })])
            .into_collaborators();
        let h = harness(collaborators).await;
        let ctx = RunContext::new()
            .with_output(StageOutput::Download(DownloadOutput {
                commit_ref: "abc".into(),
                source_dir: "source".into(),
            }))
            .unwrap();
        let inputs = AttemptInputs::default();
        let record = h
            .executor
            .execute(request(StageName::Analyze, 1, &ctx, &inputs))
            .await
            .unwrap();
        assert_eq!(record.failure.unwrap().kind, FailureKind::SemanticFailure);
    }

    #[tokio::test]
    async fn test_generated_path_escape_is_semantic() {
        let (_fake, collaborators) = FakeCollaborators::happy()
            .script_generate(vec![Ok(vec![GeneratedFile {
                path: "../../outside.py".into(),
                content: "x".into(),
            }])])
            .into_collaborators();
        let h = harness(collaborators).await;
        let ctx = RunContext::new()
            .with_output(StageOutput::Download(DownloadOutput {
                commit_ref: "abc".into(),
                source_dir: "source".into(),
            }))
            .unwrap()
            .with_output(StageOutput::Analyze(
                crate::collaborators::fakes::sample_analysis(),
            ))
            .unwrap();
        let inputs = AttemptInputs::default();
        let record = h
            .executor
            .execute(request(StageName::Generate, 1, &ctx, &inputs))
            .await
            .unwrap();
        assert_eq!(record.failure.unwrap().kind, FailureKind::SemanticFailure);
        assert!(!h.executor.workspace().root().join("../outside.py").exists());
    }

    async fn generate_once(files: Vec<GeneratedFile>) -> (Harness, StageRecord) {
        let (_fake, collaborators) = FakeCollaborators::happy()
            .script_generate(vec![Ok(files)])
            .into_collaborators();
        let h = harness(collaborators).await;
        let ctx = RunContext::new()
            .with_output(StageOutput::Download(DownloadOutput {
                commit_ref: "abc".into(),
                source_dir: "source".into(),
            }))
            .unwrap()
            .with_output(StageOutput::Analyze(
                crate::collaborators::fakes::sample_analysis(),
            ))
            .unwrap();
        let inputs = AttemptInputs::default();
        let record = h
            .executor
            .execute(request(StageName::Generate, 1, &ctx, &inputs))
            .await
            .unwrap();
        (h, record)
    }

    fn generated(path: &str, content: &str) -> GeneratedFile {
        GeneratedFile {
            path: path.into(),
            content: content.into(),
        }
    }

    #[tokio::test]
    async fn test_conflicting_generated_paths_are_semantic() {
        let (_h, record) =
            generate_once(vec![generated("pkg", "x"), generated("pkg/mod.py", "y")]).await;
        let failure = record.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::SemanticFailure);
        assert!(failure.message.contains("pkg"), "{}", failure.message);
    }

    #[tokio::test]
    async fn test_generated_manifest_is_rejected() {
        let (h, record) = generate_once(vec![
            generated("server.py", "print()"),
            generated("MANIFEST.json", "USER CONTENT"),
        ])
        .await;
        let failure = record.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::SemanticFailure);
        assert!(failure.message.contains(MANIFEST_FILE));
        assert!(!h
            .executor
            .workspace()
            .generated_dir()
            .join(MANIFEST_FILE)
            .exists());
    }

    #[tokio::test]
    async fn test_attempts_are_logged_per_stage() {
        let (h, record) =
            generate_once(vec![generated("pkg", "x"), generated("pkg/a.py", "y")]).await;
        assert!(record.failure.is_some());
        let log_path = h.executor.workspace().logs_dir().join("generate.log");
        let log = std::fs::read_to_string(log_path).unwrap();
        assert_eq!(log.lines().count(), 1);
        assert!(log.contains("attempt 1 Failed"), "{log}");
        assert!(log.contains("semantic_failure"), "{log}");
    }

    #[test]
    fn test_overlay_and_hints() {
        let mut inputs = AttemptInputs::default();
        inputs.apply(RepairAction {
            triggered_by_attempt: 1,
            failure: StageFailure::semantic("ImportError"),
            patch: RepairPatch {
                summary: "fix import".into(),
                files: vec![
                    GeneratedFile {
                        path: "server.py".into(),
                        content: "fixed".into(),
                    },
                    GeneratedFile {
                        path: "extra.py".into(),
                        content: "new".into(),
                    },
                ],
                hint: Some("use absolute imports".into()),
            },
            rerun_succeeded: false,
        });
        let files = inputs.overlay(&sample_files());
        assert_eq!(files.len(), 3);
        assert_eq!(files[0].content, "fixed");
        assert_eq!(files[2].path, "extra.py");
        assert_eq!(inputs.hints(), vec!["use absolute imports".to_string()]);
        assert_eq!(inputs.pending_repairs.len(), 1);
    }
}
