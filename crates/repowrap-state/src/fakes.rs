//! In-memory fakes for storage traits (testing only)
//!
//! `MemoryArtifactStore` satisfies the `ArtifactStore` contract without
//! touching the filesystem.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage_traits::*;

#[derive(Debug)]
struct RunState {
    record: RunRecord,
    attempts: Vec<AttemptRecord>,
    transitions: Vec<TransitionRecord>,
    report: Option<(Vec<u8>, ContentDigest)>,
}

impl RunState {
    fn ensure_open(&self) -> StorageResult<()> {
        if self.report.is_some() {
            return Err(StorageError::RunSealed {
                run_id: self.record.run_id.to_string(),
            });
        }
        Ok(())
    }
}

/// In-memory artifact store backed by a `HashMap<RunId, RunState>`.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    runs: Mutex<HashMap<RunId, RunState>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs held (handy for "nothing was written" assertions).
    pub fn run_count(&self) -> usize {
        self.runs.lock().unwrap().len()
    }
}

fn run_not_found(run_id: &RunId) -> StorageError {
    StorageError::RunNotFound {
        run_id: run_id.to_string(),
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn create_run(&self, record: RunRecord) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        if runs.contains_key(&record.run_id) {
            return Err(StorageError::AlreadyExists {
                what: format!("run {}", record.run_id),
            });
        }
        runs.insert(
            record.run_id.clone(),
            RunState {
                record,
                attempts: Vec::new(),
                transitions: Vec::new(),
                report: None,
            },
        );
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let runs = self.runs.lock().unwrap();
        runs.get(run_id)
            .map(|s| s.record.clone())
            .ok_or_else(|| run_not_found(run_id))
    }

    async fn list_runs(&self) -> StorageResult<Vec<RunRecord>> {
        let runs = self.runs.lock().unwrap();
        let mut records: Vec<RunRecord> = runs.values().map(|s| s.record.clone()).collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(records)
    }

    async fn append_attempt(&self, run_id: &RunId, record: AttemptRecord) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let state = runs.get_mut(run_id).ok_or_else(|| run_not_found(run_id))?;
        state.ensure_open()?;

        let last = state
            .attempts
            .iter()
            .filter(|a| a.key.stage == record.key.stage)
            .map(|a| a.key.attempt)
            .max();
        if let Some(last) = last {
            if record.key.attempt == last {
                return Err(StorageError::AlreadyExists {
                    what: format!("attempt {}", record.key),
                });
            }
            if record.key.attempt < last {
                return Err(StorageError::NonMonotonicAttempt {
                    stage: record.key.stage.clone(),
                    attempt: record.key.attempt,
                    last,
                });
            }
        }
        state.attempts.push(record);
        Ok(())
    }

    async fn get_attempt(
        &self,
        run_id: &RunId,
        stage: &str,
        attempt: u32,
    ) -> StorageResult<AttemptRecord> {
        let runs = self.runs.lock().unwrap();
        let state = runs.get(run_id).ok_or_else(|| run_not_found(run_id))?;
        state
            .attempts
            .iter()
            .find(|a| a.key.stage == stage && a.key.attempt == attempt)
            .cloned()
            .ok_or_else(|| StorageError::AttemptNotFound {
                run_id: run_id.to_string(),
                stage: stage.to_string(),
                attempt,
            })
    }

    async fn list_attempts(&self, run_id: &RunId) -> StorageResult<Vec<AttemptRecord>> {
        let runs = self.runs.lock().unwrap();
        let state = runs.get(run_id).ok_or_else(|| run_not_found(run_id))?;
        let mut attempts = state.attempts.clone();
        attempts.sort_by_key(|a| (a.key.stage_index, a.key.attempt));
        Ok(attempts)
    }

    async fn append_transition(
        &self,
        run_id: &RunId,
        transition: TransitionRecord,
    ) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let state = runs.get_mut(run_id).ok_or_else(|| run_not_found(run_id))?;
        state.ensure_open()?;
        if let Some(last) = state.transitions.last() {
            if transition.seq <= last.seq {
                return Err(StorageError::NonMonotonicTransition {
                    seq: transition.seq,
                    last: last.seq,
                });
            }
        }
        state.transitions.push(transition);
        Ok(())
    }

    async fn list_transitions(&self, run_id: &RunId) -> StorageResult<Vec<TransitionRecord>> {
        let runs = self.runs.lock().unwrap();
        let state = runs.get(run_id).ok_or_else(|| run_not_found(run_id))?;
        Ok(state.transitions.clone())
    }

    async fn put_report(
        &self,
        run_id: &RunId,
        report: &serde_json::Value,
    ) -> StorageResult<ContentDigest> {
        let bytes = encode_report(report)?;
        let digest = ContentDigest::from_bytes(&bytes);
        let mut runs = self.runs.lock().unwrap();
        let state = runs.get_mut(run_id).ok_or_else(|| run_not_found(run_id))?;
        if state.report.is_some() {
            return Err(StorageError::AlreadyExists {
                what: format!("report for run {run_id}"),
            });
        }
        state.report = Some((bytes, digest.clone()));
        Ok(digest)
    }

    async fn get_report(&self, run_id: &RunId) -> StorageResult<serde_json::Value> {
        let runs = self.runs.lock().unwrap();
        let state = runs.get(run_id).ok_or_else(|| run_not_found(run_id))?;
        let (bytes, digest) = state
            .report
            .as_ref()
            .ok_or_else(|| StorageError::ReportNotFound {
                run_id: run_id.to_string(),
            })?;
        let actual = ContentDigest::from_bytes(bytes);
        if &actual != digest {
            return Err(StorageError::DigestMismatch {
                what: format!("report for run {run_id}"),
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}
