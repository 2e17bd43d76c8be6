//! Run coordinator: the public entry point.
//!
//! `submit` validates its input before anything is written, creates the run
//! and its workspace, drives the pipeline to a terminal state and returns the
//! persisted [`FinalReport`]. Orchestrator faults inside a run never escape
//! as errors; they end the run as `internal_invariant_violation`.
//!
//! Runs are independent: each has its own workspace, context and records, so
//! any number may be driven concurrently on one coordinator.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use repowrap_state::{ArtifactStore, RunId, RunRecord};

use crate::cancel::{cancellation_pair, CancellationHandle, CancellationToken};
use crate::collaborators::Collaborators;
use crate::config::{OrchestratorConfig, RunOptions};
use crate::controller::RetryRepairController;
use crate::domain::{
    FinalReport, PipelineError, RepoLocator, Result, Run, RunStatus, StageRecord, SubmitError,
    Transition,
};
use crate::executor::StageExecutor;
use crate::metrics::METRICS;
use crate::obs;
use crate::pipeline::PipelineDriver;
use crate::workspace::RunWorkspace;

/// A run created but not yet driven.
struct PreparedRun {
    run: Run,
    record: RunRecord,
    workspace: RunWorkspace,
    config: OrchestratorConfig,
}

/// Handle to a run started with [`RunCoordinator::start`].
pub struct RunHandle {
    pub run_id: RunId,
    pub cancel: CancellationHandle,
    join: JoinHandle<FinalReport>,
}

impl RunHandle {
    /// Wait for the run to reach a terminal state.
    pub async fn wait(self) -> Result<FinalReport> {
        self.join
            .await
            .map_err(|e| PipelineError::Invariant(format!("run task failed: {e}")))
    }
}

pub struct RunCoordinator {
    store: Arc<dyn ArtifactStore>,
    collaborators: Collaborators,
    config: OrchestratorConfig,
}

impl RunCoordinator {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        collaborators: Collaborators,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            collaborators,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run the pipeline for `locator` to completion.
    ///
    /// `Err` only for input rejected before a run exists, or a run that could
    /// not be set up at all.
    pub async fn submit(
        &self,
        locator: &str,
        options: &RunOptions,
    ) -> std::result::Result<FinalReport, SubmitError> {
        self.submit_with_cancel(locator, options, CancellationToken::never())
            .await
    }

    pub async fn submit_with_cancel(
        &self,
        locator: &str,
        options: &RunOptions,
        cancel: CancellationToken,
    ) -> std::result::Result<FinalReport, SubmitError> {
        let prepared = self.prepare(locator, options).await?;
        Ok(self.drive(prepared, cancel).await)
    }

    /// Create the run and drive it on a background task.
    pub async fn start(
        self: &Arc<Self>,
        locator: &str,
        options: &RunOptions,
    ) -> std::result::Result<RunHandle, SubmitError> {
        let prepared = self.prepare(locator, options).await?;
        let run_id = prepared.run.id.clone();
        let (cancel, token) = cancellation_pair();
        let this = Arc::clone(self);
        let join = tokio::spawn(async move { this.drive(prepared, token).await });
        Ok(RunHandle {
            run_id,
            cancel,
            join,
        })
    }

    async fn prepare(
        &self,
        raw_locator: &str,
        options: &RunOptions,
    ) -> std::result::Result<PreparedRun, SubmitError> {
        let locator = RepoLocator::parse(raw_locator)?;
        let mut config = self.config.clone();
        config.apply(options);
        config.validate()?;

        let run_id = RunId::new();
        let workspace = RunWorkspace::create(
            &config.workspace_root,
            &run_id,
            config.output_dir.as_deref(),
        )
        .await
        .map_err(PipelineError::from)?;
        let record = RunRecord {
            run_id: run_id.clone(),
            locator: locator.normalized.clone(),
            repo_name: locator.name.clone(),
            workspace_dir: workspace.root().display().to_string(),
            config: config.to_value(),
            created_at: Utc::now(),
        };
        self.store.create_run(record.clone()).await?;

        METRICS.inc_runs_started();
        obs::emit_run_started(run_id.as_str(), &locator.normalized);
        Ok(PreparedRun {
            run: Run::new(run_id, locator, record.created_at),
            record,
            workspace,
            config,
        })
    }

    async fn drive(&self, prepared: PreparedRun, cancel: CancellationToken) -> FinalReport {
        let span = obs::run_span(prepared.run.id.as_str());
        self.drive_inner(prepared, cancel).instrument(span).await
    }

    async fn drive_inner(&self, prepared: PreparedRun, cancel: CancellationToken) -> FinalReport {
        let started = std::time::Instant::now();
        let PreparedRun {
            mut run,
            record,
            workspace,
            config,
        } = prepared;
        let run_id = run.id.clone();

        let executor = StageExecutor::new(
            run_id.clone(),
            run.locator.clone(),
            workspace,
            self.store.clone(),
            self.collaborators.clone(),
        );
        let controller =
            RetryRepairController::new(run_id.clone(), executor, self.collaborators.repair.clone());
        let driver = PipelineDriver::new(controller, self.store.clone(), config);

        if let Err(err) = driver.drive(&mut run, &cancel).await {
            obs::emit_internal_error(run_id.as_str(), &err);
            if !run.is_terminal() {
                match run.abort(&err.to_string()) {
                    Ok(transition) => {
                        if let Err(e) = driver.persist(&run, &transition).await {
                            obs::emit_internal_error(run_id.as_str(), &e);
                        }
                    }
                    Err(e) => obs::emit_internal_error(run_id.as_str(), &e),
                }
            }
        }

        let report = self.close(&run, &record).await;
        let failed_stage = report.failure.as_ref().map(|f| (f.stage, f.kind));
        match report.status {
            RunStatus::Completed => METRICS.inc_runs_completed(),
            _ => METRICS.inc_runs_failed(),
        }
        obs::emit_run_finished(
            run_id.as_str(),
            report.status,
            started.elapsed().as_millis() as u64,
            failed_stage,
        );
        METRICS.flush();
        report
    }

    /// Compute and store the report of a terminal run.
    ///
    /// The stored records are authoritative. If they cannot be read back, or
    /// disagree with the in-memory run, the in-memory view is reported.
    async fn close(&self, run: &Run, record: &RunRecord) -> FinalReport {
        let in_memory = FinalReport::compute(record, run.records(), run.transitions());
        let report = match self.rebuild_report(&run.id).await {
            Ok(stored) if stored == in_memory => stored,
            Ok(_) => {
                obs::emit_internal_error(
                    run.id.as_str(),
                    &"stored records disagree with the in-memory run",
                );
                in_memory
            }
            Err(e) => {
                obs::emit_internal_error(run.id.as_str(), &e);
                in_memory
            }
        };

        match serde_json::to_value(&report) {
            Ok(value) => match self.store.put_report(&run.id, &value).await {
                Ok(digest) => obs::emit_report_persisted(run.id.as_str(), digest.as_str()),
                Err(e) => obs::emit_internal_error(run.id.as_str(), &e),
            },
            Err(e) => obs::emit_internal_error(run.id.as_str(), &e),
        }
        report
    }

    /// Recompute a run's report from its persisted records, without
    /// executing anything.
    pub async fn rebuild_report(&self, run_id: &RunId) -> Result<FinalReport> {
        let record = self.store.get_run(run_id).await?;
        let attempts = self
            .store
            .list_attempts(run_id)
            .await?
            .iter()
            .map(StageRecord::from_attempt_record)
            .collect::<Result<Vec<_>>>()?;
        let transitions = self
            .store
            .list_transitions(run_id)
            .await?
            .iter()
            .map(Transition::from_record)
            .collect::<Result<Vec<_>>>()?;
        Ok(FinalReport::compute(&record, &attempts, &transitions))
    }

    /// Read the stored report of a finished run.
    pub async fn load_report(&self, run_id: &RunId) -> Result<FinalReport> {
        let value = self.store.get_report(run_id).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Ids of every run the store knows about, oldest first.
    pub async fn list_runs(&self) -> Result<Vec<RunId>> {
        Ok(self
            .store
            .list_runs()
            .await?
            .into_iter()
            .map(|r| r.run_id)
            .collect())
    }
}
