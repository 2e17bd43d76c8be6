use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::StorageError;
use crate::storage_traits::*;

const RUN_FILE: &str = "run.json";
const REPORT_FILE: &str = "report.json";
const REPORT_DIGEST_FILE: &str = "report.digest";

/// Filesystem-backed artifact store.
///
/// Layout:
///
/// ```text
/// <root>/runs/<run_id>/run.json
/// <root>/runs/<run_id>/stages/<index>-<stage>/attempt-<n>.json
/// <root>/runs/<run_id>/transitions/<seq>.json
/// <root>/runs/<run_id>/report.json
/// <root>/runs/<run_id>/report.digest
/// ```
///
/// Every file is written through a temp file in the same directory and
/// persisted with a no-clobber rename, so a record either exists completely
/// or not at all, and never gets overwritten. `report.digest` is written
/// last and seals the run.
///
/// All file I/O runs on tokio's blocking pool.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    runs_dir: PathBuf,
}

impl FsArtifactStore {
    /// Create a store rooted at `root`. Creates `root/runs/` if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let runs_dir = root.as_ref().join("runs");
        fs::create_dir_all(&runs_dir)?;
        Ok(Self { runs_dir })
    }

    fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.runs_dir.join(run_id.as_str())
    }

    fn existing_run_dir(&self, run_id: &RunId) -> StorageResult<PathBuf> {
        let dir = self.run_dir(run_id);
        if !dir.join(RUN_FILE).is_file() {
            return Err(StorageError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }
        Ok(dir)
    }

    fn ensure_open(&self, run_dir: &Path, run_id: &RunId) -> StorageResult<()> {
        if run_dir.join(REPORT_DIGEST_FILE).exists() {
            return Err(StorageError::RunSealed {
                run_id: run_id.to_string(),
            });
        }
        Ok(())
    }

    fn stage_dir(run_dir: &Path, key: &AttemptKey) -> PathBuf {
        run_dir
            .join("stages")
            .join(format!("{:02}-{}", key.stage_index, key.stage))
    }

    /// Highest attempt number already stored for a stage directory.
    fn last_attempt(stage_dir: &Path) -> StorageResult<Option<u32>> {
        if !stage_dir.is_dir() {
            return Ok(None);
        }
        let mut last = None;
        for entry in fs::read_dir(stage_dir)? {
            let name = entry?.file_name();
            if let Some(n) = parse_attempt_file(&name.to_string_lossy()) {
                last = Some(last.map_or(n, |l: u32| l.max(n)));
            }
        }
        Ok(last)
    }

    fn find_stage_dir(run_dir: &Path, stage: &str) -> StorageResult<Option<PathBuf>> {
        let stages = run_dir.join("stages");
        if !stages.is_dir() {
            return Ok(None);
        }
        for entry in fs::read_dir(&stages)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.split_once('-').map(|(_, s)| s) == Some(stage) {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }
}

fn parse_attempt_file(name: &str) -> Option<u32> {
    name.strip_prefix("attempt-")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

fn validate_segment(kind: &str, value: &str) -> StorageResult<()> {
    let ok = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !ok {
        return Err(StorageError::InvalidKey(format!("{kind} {value:?}")));
    }
    Ok(())
}

/// Write `data` to `path` unless it already exists.
fn write_once(path: &Path, data: &[u8], what: impl FnOnce() -> String) -> StorageResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| StorageError::InvalidKey(path.display().to_string()))?;
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist_noclobber(path).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::AlreadyExists {
            StorageError::AlreadyExists { what: what() }
        } else {
            StorageError::Io(e.error)
        }
    })?;
    debug!(path = %path.display(), bytes = data.len(), "record written");
    Ok(())
}

fn write_json_once<T: Serialize>(
    path: &Path,
    value: &T,
    what: impl FnOnce() -> String,
) -> StorageResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_once(path, &bytes, what)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> StorageResult<T> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn not_found_as<T>(
    result: StorageResult<T>,
    err: impl FnOnce() -> StorageError,
) -> StorageResult<T> {
    match result {
        Err(StorageError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(err()),
        other => other,
    }
}

// Blocking bodies of the `ArtifactStore` methods. The async impl below runs
// each of them on tokio's blocking pool.
impl FsArtifactStore {
    fn create_run_blocking(&self, record: RunRecord) -> StorageResult<()> {
        let run_id = record.run_id.clone();
        let path = self.run_dir(&run_id).join(RUN_FILE);
        write_json_once(&path, &record, || format!("run {run_id}"))
    }

    fn get_run_blocking(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let path = self.run_dir(run_id).join(RUN_FILE);
        not_found_as(read_json(&path), || StorageError::RunNotFound {
            run_id: run_id.to_string(),
        })
    }

    fn list_runs_blocking(&self) -> StorageResult<Vec<RunRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.runs_dir)? {
            let path = entry?.path().join(RUN_FILE);
            if path.is_file() {
                records.push(read_json::<RunRecord>(&path)?);
            }
        }
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(records)
    }

    fn append_attempt_blocking(&self, run_id: &RunId, record: AttemptRecord) -> StorageResult<()> {
        validate_segment("stage", &record.key.stage)?;
        let run_dir = self.existing_run_dir(run_id)?;
        self.ensure_open(&run_dir, run_id)?;

        let stage_dir = Self::stage_dir(&run_dir, &record.key);
        if let Some(last) = Self::last_attempt(&stage_dir)? {
            if record.key.attempt < last {
                return Err(StorageError::NonMonotonicAttempt {
                    stage: record.key.stage.clone(),
                    attempt: record.key.attempt,
                    last,
                });
            }
        }

        let path = stage_dir.join(format!("attempt-{}.json", record.key.attempt));
        let key = record.key.clone();
        write_json_once(&path, &record, || format!("attempt {key}"))
    }

    fn get_attempt_blocking(
        &self,
        run_id: &RunId,
        stage: &str,
        attempt: u32,
    ) -> StorageResult<AttemptRecord> {
        validate_segment("stage", stage)?;
        let run_dir = self.existing_run_dir(run_id)?;
        let not_found = || StorageError::AttemptNotFound {
            run_id: run_id.to_string(),
            stage: stage.to_string(),
            attempt,
        };
        let stage_dir = Self::find_stage_dir(&run_dir, stage)?.ok_or_else(not_found)?;
        let path = stage_dir.join(format!("attempt-{attempt}.json"));
        not_found_as(read_json(&path), not_found)
    }

    fn list_attempts_blocking(&self, run_id: &RunId) -> StorageResult<Vec<AttemptRecord>> {
        let run_dir = self.existing_run_dir(run_id)?;
        let stages = run_dir.join("stages");
        let mut attempts = Vec::new();
        if stages.is_dir() {
            for stage_entry in fs::read_dir(&stages)? {
                let stage_path = stage_entry?.path();
                for entry in fs::read_dir(&stage_path)? {
                    let entry = entry?;
                    if parse_attempt_file(&entry.file_name().to_string_lossy()).is_some() {
                        attempts.push(read_json::<AttemptRecord>(&entry.path())?);
                    }
                }
            }
        }
        attempts.sort_by_key(|a| (a.key.stage_index, a.key.attempt));
        Ok(attempts)
    }

    fn append_transition_blocking(
        &self,
        run_id: &RunId,
        transition: TransitionRecord,
    ) -> StorageResult<()> {
        let run_dir = self.existing_run_dir(run_id)?;
        self.ensure_open(&run_dir, run_id)?;

        let last = self.list_transitions_blocking(run_id)?.last().map(|t| t.seq);
        if let Some(last) = last {
            if transition.seq <= last {
                return Err(StorageError::NonMonotonicTransition {
                    seq: transition.seq,
                    last,
                });
            }
        }

        let seq = transition.seq;
        let path = run_dir
            .join("transitions")
            .join(format!("{seq:06}.json"));
        write_json_once(&path, &transition, || format!("transition {seq}"))
    }

    fn list_transitions_blocking(&self, run_id: &RunId) -> StorageResult<Vec<TransitionRecord>> {
        let run_dir = self.existing_run_dir(run_id)?;
        let dir = run_dir.join("transitions");
        let mut transitions = Vec::new();
        if dir.is_dir() {
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().is_some_and(|e| e == "json") {
                    transitions.push(read_json::<TransitionRecord>(&path)?);
                }
            }
        }
        transitions.sort_by_key(|t| t.seq);
        Ok(transitions)
    }

    fn put_report_blocking(
        &self,
        run_id: &RunId,
        report: &serde_json::Value,
    ) -> StorageResult<ContentDigest> {
        let run_dir = self.existing_run_dir(run_id)?;
        let report_path = run_dir.join(REPORT_FILE);
        let digest_path = run_dir.join(REPORT_DIGEST_FILE);
        let bytes = encode_report(report)?;
        let digest = ContentDigest::from_bytes(&bytes);

        if digest_path.exists() {
            return Err(StorageError::AlreadyExists {
                what: format!("report for run {run_id}"),
            });
        }
        // The digest seals the run. A report without one is left over from an
        // interrupted write and is replaced.
        match fs::remove_file(&report_path) {
            Ok(()) => debug!(run_id = %run_id, "discarded unsealed report"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        write_once(&report_path, &bytes, || format!("report for run {run_id}"))?;
        write_once(&digest_path, digest.as_str().as_bytes(), || {
            format!("report digest for run {run_id}")
        })?;
        Ok(digest)
    }

    fn get_report_blocking(&self, run_id: &RunId) -> StorageResult<serde_json::Value> {
        let run_dir = self.existing_run_dir(run_id)?;
        let not_found = || StorageError::ReportNotFound {
            run_id: run_id.to_string(),
        };
        let expected = not_found_as(
            fs::read_to_string(run_dir.join(REPORT_DIGEST_FILE)).map_err(StorageError::from),
            not_found,
        )?;
        let bytes = fs::read(run_dir.join(REPORT_FILE))?;
        let actual = ContentDigest::from_bytes(&bytes);
        if expected.trim() != actual.as_str() {
            return Err(StorageError::DigestMismatch {
                what: format!("report for run {run_id}"),
                expected: expected.trim().to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Run `f` on the blocking pool.
async fn blocking<T, F>(f: F) -> StorageResult<T>
where
    F: FnOnce() -> StorageResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        StorageError::Io(std::io::Error::other(format!("storage task failed: {e}")))
    })?
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn create_run(&self, record: RunRecord) -> StorageResult<()> {
        let store = self.clone();
        blocking(move || store.create_run_blocking(record)).await
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let (store, run_id) = (self.clone(), run_id.clone());
        blocking(move || store.get_run_blocking(&run_id)).await
    }

    async fn list_runs(&self) -> StorageResult<Vec<RunRecord>> {
        let store = self.clone();
        blocking(move || store.list_runs_blocking()).await
    }

    async fn append_attempt(&self, run_id: &RunId, record: AttemptRecord) -> StorageResult<()> {
        let (store, run_id) = (self.clone(), run_id.clone());
        blocking(move || store.append_attempt_blocking(&run_id, record)).await
    }

    async fn get_attempt(
        &self,
        run_id: &RunId,
        stage: &str,
        attempt: u32,
    ) -> StorageResult<AttemptRecord> {
        let (store, run_id, stage) = (self.clone(), run_id.clone(), stage.to_string());
        blocking(move || store.get_attempt_blocking(&run_id, &stage, attempt)).await
    }

    async fn list_attempts(&self, run_id: &RunId) -> StorageResult<Vec<AttemptRecord>> {
        let (store, run_id) = (self.clone(), run_id.clone());
        blocking(move || store.list_attempts_blocking(&run_id)).await
    }

    async fn append_transition(
        &self,
        run_id: &RunId,
        transition: TransitionRecord,
    ) -> StorageResult<()> {
        let (store, run_id) = (self.clone(), run_id.clone());
        blocking(move || store.append_transition_blocking(&run_id, transition)).await
    }

    async fn list_transitions(&self, run_id: &RunId) -> StorageResult<Vec<TransitionRecord>> {
        let (store, run_id) = (self.clone(), run_id.clone());
        blocking(move || store.list_transitions_blocking(&run_id)).await
    }

    async fn put_report(
        &self,
        run_id: &RunId,
        report: &serde_json::Value,
    ) -> StorageResult<ContentDigest> {
        let (store, run_id, report) = (self.clone(), run_id.clone(), report.clone());
        blocking(move || store.put_report_blocking(&run_id, &report)).await
    }

    async fn get_report(&self, run_id: &RunId) -> StorageResult<serde_json::Value> {
        let (store, run_id) = (self.clone(), run_id.clone());
        blocking(move || store.get_report_blocking(&run_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_store() -> (tempfile::TempDir, FsArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn run_record(id: &str) -> RunRecord {
        RunRecord {
            run_id: id.parse().unwrap(),
            locator: "https://github.com/acme/widget".to_string(),
            repo_name: "widget".to_string(),
            workspace_dir: "/tmp/ws".to_string(),
            config: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    fn attempt(stage: &str, index: u32, n: u32) -> AttemptRecord {
        AttemptRecord {
            key: AttemptKey::new(stage, index, n),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            succeeded: n > 1,
            payload: serde_json::json!({ "n": n }),
        }
    }

    #[test]
    fn parse_attempt_file_names() {
        assert_eq!(parse_attempt_file("attempt-3.json"), Some(3));
        assert_eq!(parse_attempt_file("attempt-x.json"), None);
        assert_eq!(parse_attempt_file("report.json"), None);
    }

    #[tokio::test]
    async fn layout_on_disk() {
        let (dir, store) = make_store();
        store.create_run(run_record("run-a")).await.unwrap();
        store
            .append_attempt(&"run-a".parse().unwrap(), attempt("download", 0, 1))
            .await
            .unwrap();

        let run_dir = dir.path().join("runs").join("run-a");
        assert!(run_dir.join("run.json").is_file());
        assert!(run_dir
            .join("stages")
            .join("00-download")
            .join("attempt-1.json")
            .is_file());
    }

    #[tokio::test]
    async fn attempt_is_write_once() {
        let (_dir, store) = make_store();
        let id: RunId = "run-b".parse().unwrap();
        store.create_run(run_record("run-b")).await.unwrap();
        store.append_attempt(&id, attempt("analyze", 1, 1)).await.unwrap();
        let err = store
            .append_attempt(&id, attempt("analyze", 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn tampered_report_is_detected() {
        let (dir, store) = make_store();
        let id: RunId = "run-c".parse().unwrap();
        store.create_run(run_record("run-c")).await.unwrap();
        store
            .put_report(&id, &serde_json::json!({"status": "completed"}))
            .await
            .unwrap();

        let path = dir.path().join("runs").join("run-c").join("report.json");
        std::fs::write(&path, b"{\"status\":\"failed\"}").unwrap();

        let err = store.get_report(&id).await.unwrap_err();
        assert!(matches!(err, StorageError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn unsealed_report_is_replaced() {
        let (dir, store) = make_store();
        let id: RunId = "run-e".parse().unwrap();
        store.create_run(run_record("run-e")).await.unwrap();

        // Report written, digest never was.
        let run_dir = dir.path().join("runs").join("run-e");
        std::fs::write(run_dir.join("report.json"), b"{\"status\":\"partial\"}").unwrap();
        assert!(matches!(
            store.get_report(&id).await.unwrap_err(),
            StorageError::ReportNotFound { .. }
        ));
        store.append_attempt(&id, attempt("analyze", 1, 1)).await.unwrap();

        let report = serde_json::json!({"status": "completed"});
        store.put_report(&id, &report).await.unwrap();
        assert_eq!(store.get_report(&id).await.unwrap(), report);
        assert!(matches!(
            store.put_report(&id, &report).await.unwrap_err(),
            StorageError::AlreadyExists { .. }
        ));
        assert!(matches!(
            store.append_attempt(&id, attempt("analyze", 1, 2)).await.unwrap_err(),
            StorageError::RunSealed { .. }
        ));
    }

    #[tokio::test]
    async fn bad_stage_name_rejected() {
        let (_dir, store) = make_store();
        let id: RunId = "run-d".parse().unwrap();
        store.create_run(run_record("run-d")).await.unwrap();
        let err = store
            .append_attempt(&id, attempt("../escape", 0, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }
}
