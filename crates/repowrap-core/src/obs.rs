//! Structured observability hooks for run lifecycle events.
//!
//! This module provides:
//! - Run-scoped tracing spans via `RunSpan`
//! - Emission functions for run start, attempt close, repair, transition,
//!   run finish and report persistence
//!
//! Events are emitted at `info!` level unless noted (filter with
//! `RUST_LOG`, e.g. `RUST_LOG=repowrap_core=debug`).

use tracing::{info, warn};

use crate::domain::{FailureKind, PipelineState, RunStatus, StageName, StageRecord};

/// RAII guard that enters a run-scoped tracing span.
///
/// Only for synchronous sections; async code uses [`run_span`] with
/// `Instrument`.
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str) -> Self {
        Self {
            _span: run_span(run_id).entered(),
        }
    }
}

/// Span tagged with the run id.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("repowrap.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, locator: &str) {
    info!(event = "run.started", run_id = %run_id, locator = %locator);
}

pub fn emit_attempt_closed(run_id: &str, record: &StageRecord) {
    match &record.failure {
        None => info!(
            event = "stage.attempt_closed",
            run_id = %run_id,
            stage = %record.stage,
            attempt = record.attempt,
            duration_ms = record.duration_ms,
            succeeded = true,
        ),
        Some(failure) => warn!(
            event = "stage.attempt_closed",
            run_id = %run_id,
            stage = %record.stage,
            attempt = record.attempt,
            duration_ms = record.duration_ms,
            succeeded = false,
            kind = %failure.kind,
            message = %failure.message,
        ),
    }
}

pub fn emit_repair_applied(run_id: &str, stage: StageName, attempt: u32, summary: &str) {
    info!(
        event = "stage.repair_applied",
        run_id = %run_id,
        stage = %stage,
        attempt = attempt,
        summary = %summary,
    );
}

/// Emit event: the repair collaborator had nothing (or failed).
pub fn emit_repair_unavailable(run_id: &str, stage: StageName, attempt: u32, reason: &str) {
    warn!(
        event = "stage.repair_unavailable",
        run_id = %run_id,
        stage = %stage,
        attempt = attempt,
        reason = %reason,
    );
}

pub fn emit_transition(run_id: &str, seq: u64, from: PipelineState, to: PipelineState) {
    info!(event = "run.transition", run_id = %run_id, seq = seq, from = %from, to = %to);
}

/// Emit event: run reached a terminal state.
pub fn emit_run_finished(
    run_id: &str,
    status: RunStatus,
    duration_ms: u64,
    failed_stage: Option<(StageName, FailureKind)>,
) {
    match failed_stage {
        None => info!(
            event = "run.finished",
            run_id = %run_id,
            status = %status,
            duration_ms = duration_ms,
        ),
        Some((stage, kind)) => warn!(
            event = "run.finished",
            run_id = %run_id,
            status = %status,
            duration_ms = duration_ms,
            stage = %stage,
            kind = %kind,
        ),
    }
}

pub fn emit_report_persisted(run_id: &str, digest: &str) {
    info!(event = "report.persisted", run_id = %run_id, digest = %digest);
}

/// Emit event: orchestrator fault (error level).
pub fn emit_internal_error(run_id: &str, error: &dyn std::fmt::Display) {
    tracing::error!(event = "run.internal_error", run_id = %run_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StageFailure;

    #[test]
    fn test_run_span_create() {
        let _span = RunSpan::enter("test-run-id");
    }

    #[test]
    fn test_emitters_do_not_panic() {
        let record = StageRecord::closed(
            StageName::Download,
            1,
            chrono::Utc::now(),
            Err(StageFailure::transient("reset")),
            vec![],
        );
        emit_attempt_closed("r", &record);
        emit_transition(
            "r",
            1,
            PipelineState::Active(StageName::Download),
            PipelineState::Failed,
        );
        emit_run_finished(
            "r",
            RunStatus::Failed,
            5,
            Some((StageName::Download, FailureKind::TransientInfrastructure)),
        );
    }
}
