//! Per-run private workspace.
//!
//! Layout under `<workspace_root>/<run_id>/`:
//!
//! ```text
//! source/      clone target
//! generated/   generated adapter/service files
//! output/      finalized deliverable
//! work/<stage>/ working copies of stages that validate patched files
//! logs/<stage>.log  one line per closed attempt
//! ```
//!
//! All writes go through [`RunWorkspace`], which refuses paths that would
//! leave the run's own directories.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use tokio::io::AsyncWriteExt;

use repowrap_state::RunId;

use crate::domain::{GeneratedFile, StageFailure, StageName};

pub const SOURCE_DIR: &str = "source";
pub const GENERATED_DIR: &str = "generated";
pub const OUTPUT_DIR: &str = "output";
pub const LOGS_DIR: &str = "logs";
pub const WORK_DIR: &str = "work";
pub const MANIFEST_FILE: &str = "MANIFEST.json";

#[derive(Debug, Clone)]
pub struct RunWorkspace {
    root: PathBuf,
    output: PathBuf,
}

impl RunWorkspace {
    /// Create the directory tree for `run_id`.
    ///
    /// `output_root`, when set, replaces `<workspace>/output` with
    /// `<output_root>/<run_id>`.
    pub async fn create(
        workspace_root: &Path,
        run_id: &RunId,
        output_root: Option<&Path>,
    ) -> std::io::Result<Self> {
        let root = workspace_root.join(run_id.as_str());
        let output = match output_root {
            Some(dir) => dir.join(run_id.as_str()),
            None => root.join(OUTPUT_DIR),
        };
        for dir in [
            root.join(SOURCE_DIR),
            root.join(GENERATED_DIR),
            root.join(LOGS_DIR),
            root.join(WORK_DIR),
            output.clone(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(Self { root, output })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source_dir(&self) -> PathBuf {
        self.root.join(SOURCE_DIR)
    }

    pub fn generated_dir(&self) -> PathBuf {
        self.root.join(GENERATED_DIR)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    /// Append one line to the log of `stage`.
    pub async fn append_log(&self, stage: StageName, line: &str) -> std::io::Result<()> {
        let path = self.logs_dir().join(format!("{}.log", stage.name()));
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(format!("{line}\n").as_bytes()).await?;
        file.flush().await
    }

    /// Private working directory of one stage.
    pub fn work_dir(&self, stage: StageName) -> PathBuf {
        self.root.join(WORK_DIR).join(stage.name())
    }

    /// Empty `dir` (creating it if needed). Only directories owned by this
    /// run may be reset.
    pub async fn fresh_dir(&self, dir: &Path) -> std::io::Result<()> {
        if !(dir.starts_with(&self.root) || dir.starts_with(&self.output)) || dir == self.root {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("{} is outside the run workspace", dir.display()),
            ));
        }
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        tokio::fs::create_dir_all(dir).await
    }

    /// `path` relative to the workspace root when inside it, else as given.
    pub fn display_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string()
    }

    /// Write `files` under `dir`, replacing existing contents of the same
    /// paths. Every path is checked before anything is written.
    pub async fn write_files(
        &self,
        dir: &Path,
        files: &[GeneratedFile],
    ) -> Result<Vec<String>, StageFailure> {
        let targets = files
            .iter()
            .map(|file| confined(dir, &file.path))
            .collect::<Result<Vec<_>, _>>()?;
        check_layout(dir, &targets)?;

        let mut written = Vec::with_capacity(files.len());
        for (file, target) in files.iter().zip(targets) {
            let result = async {
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&target, &file.content).await
            }
            .await;
            if let Err(e) = result {
                return Err(StageFailure::internal(format!(
                    "failed to write {}: {e}",
                    self.display_path(&target)
                ))
                .with_artifacts(written));
            }
            written.push(self.display_path(&target));
        }
        Ok(written)
    }
}

/// Resolve `relative` under `base`, rejecting absolute paths and `..`.
pub fn confined(base: &Path, relative: &str) -> Result<PathBuf, StageFailure> {
    let path = Path::new(relative);
    if relative.trim().is_empty() {
        return Err(StageFailure::semantic("generated file has an empty path"));
    }
    let mut resolved = base.to_path_buf();
    for component in path.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StageFailure::semantic(format!(
                    "generated file path {relative:?} escapes the workspace"
                )));
            }
        }
    }
    if resolved == base {
        return Err(StageFailure::semantic(format!(
            "generated file path {relative:?} names no file"
        )));
    }
    Ok(resolved)
}

/// Reject file sets that cannot coexist on disk: the same path twice, or a
/// file that is also the parent directory of another.
fn check_layout(base: &Path, targets: &[PathBuf]) -> Result<(), StageFailure> {
    let mut seen = BTreeSet::new();
    for target in targets {
        if !seen.insert(target.as_path()) {
            return Err(StageFailure::semantic(format!(
                "generated file {} appears more than once",
                relative_display(base, target)
            )));
        }
    }
    for target in targets {
        if let Some(parent) = target
            .ancestors()
            .skip(1)
            .take_while(|a| *a != base)
            .find(|a| seen.contains(a))
        {
            return Err(StageFailure::semantic(format!(
                "generated file {} is also the directory of {}",
                relative_display(base, parent),
                relative_display(base, target)
            )));
        }
    }
    Ok(())
}

fn relative_display(base: &Path, path: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string()
}

/// Reject files that would collide with what finalize writes itself.
pub fn check_deliverable(files: &[GeneratedFile]) -> Result<(), StageFailure> {
    for file in files {
        if confined(Path::new(""), &file.path)? == Path::new(MANIFEST_FILE) {
            return Err(StageFailure::semantic(format!(
                "generated file {:?} collides with the output manifest",
                file.path
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FailureKind;

    fn file(path: &str) -> GeneratedFile {
        GeneratedFile {
            path: path.into(),
            content: "x".into(),
        }
    }

    #[test]
    fn test_confined_rejects_escapes() {
        let base = Path::new("/ws/run/generated");
        assert_eq!(
            confined(base, "pkg/server.py").unwrap(),
            PathBuf::from("/ws/run/generated/pkg/server.py")
        );
        assert_eq!(
            confined(base, "./a.txt").unwrap(),
            PathBuf::from("/ws/run/generated/a.txt")
        );
        for bad in ["../x", "a/../../x", "/etc/passwd", "", ".", "  "] {
            let err = confined(base, bad).unwrap_err();
            assert_eq!(err.kind, FailureKind::SemanticFailure, "{bad:?}");
        }
    }

    #[tokio::test]
    async fn test_create_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let run_id: RunId = "run-a".parse().unwrap();
        let ws = RunWorkspace::create(tmp.path(), &run_id, None).await.unwrap();
        assert!(ws.source_dir().is_dir());
        assert!(ws.generated_dir().is_dir());
        assert!(ws.logs_dir().is_dir());
        assert_eq!(ws.output_dir(), tmp.path().join("run-a").join(OUTPUT_DIR));
        assert_eq!(ws.display_path(&ws.generated_dir()), "generated");
    }

    #[tokio::test]
    async fn test_output_override() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let run_id: RunId = "run-b".parse().unwrap();
        let ws = RunWorkspace::create(tmp.path(), &run_id, Some(out.path()))
            .await
            .unwrap();
        assert_eq!(ws.output_dir(), out.path().join("run-b"));
        assert!(ws.output_dir().is_dir());
    }

    #[tokio::test]
    async fn test_write_files_checks_all_paths_first() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = RunWorkspace::create(tmp.path(), &"run-c".parse().unwrap(), None)
            .await
            .unwrap();
        let err = ws
            .write_files(&ws.generated_dir(), &[file("ok.py"), file("../evil.py")])
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::SemanticFailure);
        assert!(!ws.generated_dir().join("ok.py").exists());

        let written = ws
            .write_files(&ws.generated_dir(), &[file("pkg/ok.py")])
            .await
            .unwrap();
        assert_eq!(written, vec!["generated/pkg/ok.py".to_string()]);
    }

    #[tokio::test]
    async fn test_conflicting_paths_are_semantic() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = RunWorkspace::create(tmp.path(), &"run-e".parse().unwrap(), None)
            .await
            .unwrap();
        let dir = ws.generated_dir();

        let err = ws
            .write_files(&dir, &[file("pkg"), file("pkg/mod.py")])
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::SemanticFailure);
        assert!(err.message.contains("pkg/mod.py"), "{}", err.message);

        let err = ws
            .write_files(&dir, &[file("a/b/c.py"), file("a")])
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::SemanticFailure);

        let err = ws
            .write_files(&dir, &[file("x.py"), file("./x.py")])
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::SemanticFailure);
        assert!(!dir.join("x.py").exists());

        ws.write_files(&dir, &[file("pkg/a.py"), file("pkg/b.py")])
            .await
            .unwrap();
    }

    #[test]
    fn test_manifest_name_is_reserved() {
        let err = check_deliverable(&[file("server.py"), file("./MANIFEST.json")]).unwrap_err();
        assert_eq!(err.kind, FailureKind::SemanticFailure);
        check_deliverable(&[file("docs/MANIFEST.json")]).unwrap();
    }

    #[tokio::test]
    async fn test_stage_log_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = RunWorkspace::create(tmp.path(), &"run-f".parse().unwrap(), None)
            .await
            .unwrap();
        ws.append_log(StageName::Download, "attempt 1 failed")
            .await
            .unwrap();
        ws.append_log(StageName::Download, "attempt 2 succeeded")
            .await
            .unwrap();
        let log = std::fs::read_to_string(ws.logs_dir().join("download.log")).unwrap();
        assert_eq!(log, "attempt 1 failed\nattempt 2 succeeded\n");
    }

    #[tokio::test]
    async fn test_fresh_dir_stays_inside_run() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = RunWorkspace::create(tmp.path(), &"run-d".parse().unwrap(), None)
            .await
            .unwrap();
        let work = ws.work_dir(StageName::ReviewAndRepair);
        ws.write_files(&work, &[file("stale.py")]).await.unwrap();
        ws.fresh_dir(&work).await.unwrap();
        assert!(work.is_dir());
        assert!(!work.join("stale.py").exists());

        assert!(ws.fresh_dir(tmp.path()).await.is_err());
        assert!(ws.fresh_dir(ws.root()).await.is_err());
    }

    #[tokio::test]
    async fn test_runs_do_not_share_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let a = RunWorkspace::create(tmp.path(), &"run-1".parse().unwrap(), None)
            .await
            .unwrap();
        let b = RunWorkspace::create(tmp.path(), &"run-2".parse().unwrap(), None)
            .await
            .unwrap();
        a.write_files(&a.generated_dir(), &[file("same.py")])
            .await
            .unwrap();
        assert!(!b.generated_dir().join("same.py").exists());
    }
}
