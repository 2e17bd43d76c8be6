//! Storage trait definitions for repowrap
//!
//! The artifact store is the only resource shared between concurrent runs.
//! Everything it holds is keyed by run id, and every record is written once:
//!
//! - a run record, created at submission
//! - attempt records, addressable by (run id, stage, attempt)
//! - state-machine transitions, in sequence order
//! - the final report, after which the run is sealed
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidKey(format!("digest {s}")));
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a pipeline run.
///
/// Restricted to `[A-Za-z0-9_-]` so it is always safe as a path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<String> for RunId {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        let valid = !s.is_empty()
            && s.len() <= 128
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StorageError::InvalidKey(format!("run id {s:?}")));
        }
        Ok(RunId(s))
    }
}

impl std::str::FromStr for RunId {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        RunId::try_from(s.to_string())
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Identity of a run, written once at submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    /// Normalized repository locator
    pub locator: String,
    /// Repository name derived from the locator
    pub repo_name: String,
    /// The run's private workspace directory
    pub workspace_dir: String,
    /// Effective configuration the run was submitted with
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Address of one attempt of one stage.
///
/// `stage_index` is the stage's position in the pipeline and only exists so
/// listings come back in pipeline order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptKey {
    pub stage: String,
    pub stage_index: u32,
    pub attempt: u32,
}

impl AttemptKey {
    pub fn new(stage: impl Into<String>, stage_index: u32, attempt: u32) -> Self {
        Self {
            stage: stage.into(),
            stage_index,
            attempt,
        }
    }
}

impl std::fmt::Display for AttemptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.stage, self.attempt)
    }
}

/// A closed attempt record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub key: AttemptKey,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: bool,
    /// Full stage record as produced by the executor
    pub payload: serde_json::Value,
}

/// One recorded state-machine transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Monotonic sequence number within the run
    pub seq: u64,
    pub from: String,
    pub to: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub detail: serde_json::Value,
}

// ---------------------------------------------------------------------------
// ArtifactStore
// ---------------------------------------------------------------------------

/// Append-only artifact store.
///
/// Guarantees:
/// - Every record is written at most once; rewriting is `AlreadyExists`.
/// - Attempt numbers are strictly increasing per (run, stage).
/// - Transition `seq` is strictly increasing per run.
/// - Once a report is stored the run is sealed and rejects further appends.
/// - Writes for one run never touch another run's records.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist the run record. Fails if the run already exists.
    async fn create_run(&self, record: RunRecord) -> StorageResult<()>;

    /// Retrieve a run record by ID.
    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord>;

    /// List all run records, oldest first.
    async fn list_runs(&self) -> StorageResult<Vec<RunRecord>>;

    /// Append a closed attempt record.
    async fn append_attempt(&self, run_id: &RunId, record: AttemptRecord) -> StorageResult<()>;

    /// Retrieve one attempt by (run, stage, attempt).
    async fn get_attempt(
        &self,
        run_id: &RunId,
        stage: &str,
        attempt: u32,
    ) -> StorageResult<AttemptRecord>;

    /// All attempts of a run ordered by (stage index, attempt).
    async fn list_attempts(&self, run_id: &RunId) -> StorageResult<Vec<AttemptRecord>>;

    /// Append a state-machine transition.
    async fn append_transition(
        &self,
        run_id: &RunId,
        transition: TransitionRecord,
    ) -> StorageResult<()>;

    /// All transitions of a run ordered by seq.
    async fn list_transitions(&self, run_id: &RunId) -> StorageResult<Vec<TransitionRecord>>;

    /// Store the final report and seal the run. Returns the report digest.
    async fn put_report(
        &self,
        run_id: &RunId,
        report: &serde_json::Value,
    ) -> StorageResult<ContentDigest>;

    /// Read the final report, verifying its digest.
    async fn get_report(&self, run_id: &RunId) -> StorageResult<serde_json::Value>;
}

/// Canonical byte encoding used for report storage and digests.
pub fn encode_report(report: &serde_json::Value) -> StorageResult<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(report)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable() {
        let a = ContentDigest::from_bytes(b"report");
        let b = ContentDigest::from_bytes(b"report");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_eq!(a.short().len(), 12);
    }

    #[test]
    fn digest_try_from_rejects_garbage() {
        assert!(ContentDigest::try_from("xyz".to_string()).is_err());
        let ok = ContentDigest::from_bytes(b"x").as_str().to_uppercase();
        assert!(ContentDigest::try_from(ok).is_ok());
    }

    #[test]
    fn run_id_rejects_path_components() {
        assert!("../etc".parse::<RunId>().is_err());
        assert!("".parse::<RunId>().is_err());
        assert!("a/b".parse::<RunId>().is_err());
        assert!("run-123_abc".parse::<RunId>().is_ok());
        assert!(RunId::new().as_str().len() >= 32);
    }

    #[test]
    fn run_id_deserialize_validates() {
        let bad: Result<RunId, _> = serde_json::from_str("\"../x\"");
        assert!(bad.is_err());
        let good: RunId = serde_json::from_str("\"run-1\"").unwrap();
        assert_eq!(good.as_str(), "run-1");
    }
}
