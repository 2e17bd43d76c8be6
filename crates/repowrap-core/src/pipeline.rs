//! Pipeline state machine driver.
//!
//! Walks a [`Run`] through the fixed stage order, one stage at a time. Each
//! transition is persisted as soon as the in-memory run accepts it. Between
//! stages the cancellation token is checked; a cancelled run fails before the
//! next stage starts.

use std::sync::Arc;

use repowrap_state::ArtifactStore;

use crate::cancel::CancellationToken;
use crate::config::OrchestratorConfig;
use crate::controller::{RetryRepairController, StageOutcome};
use crate::domain::{Result, Run, Transition};
use crate::obs;

pub struct PipelineDriver {
    controller: RetryRepairController,
    store: Arc<dyn ArtifactStore>,
    config: OrchestratorConfig,
}

impl PipelineDriver {
    pub fn new(
        controller: RetryRepairController,
        store: Arc<dyn ArtifactStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            controller,
            store,
            config,
        }
    }

    /// Drive `run` until it is terminal.
    ///
    /// `Err` is an orchestrator fault; the run is then left at whatever state
    /// it last reached and the caller decides how to close it.
    pub async fn drive(&self, run: &mut Run, cancel: &CancellationToken) -> Result<()> {
        while let Some(stage) = run.active_stage() {
            if cancel.is_cancelled() {
                let transition = run.cancel(&format!("run cancelled before {stage} started"))?;
                self.persist(run, &transition).await?;
                break;
            }

            run.begin_stage(stage)?;
            let policy = self.config.policy(stage);
            let stage_run = self
                .controller
                .run_stage(stage, policy, run.context())
                .await?;
            run.record_attempts(stage, stage_run.records)?;

            let transition = match stage_run.outcome {
                StageOutcome::Succeeded(output) => run.advance(output)?,
                StageOutcome::Failed(failure) => run.fail(stage, &failure)?,
            };
            self.persist(run, &transition).await?;
        }
        Ok(())
    }

    /// Persist and announce a transition the run already accepted.
    pub async fn persist(&self, run: &Run, transition: &Transition) -> Result<()> {
        self.store
            .append_transition(&run.id, transition.to_record()?)
            .await?;
        obs::emit_transition(
            run.id.as_str(),
            transition.seq,
            transition.from,
            transition.to,
        );
        Ok(())
    }
}
