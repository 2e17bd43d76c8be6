//! Process-backed collaborators.
//!
//! The configured command is spawned once per call. It receives one JSON
//! document on stdin:
//!
//! ```json
//! {"operation": "analyze", "request": { ... }}
//! ```
//!
//! and must print one JSON envelope on stdout:
//!
//! ```json
//! {"status": "ok", "result": { ... }}
//! {"status": "error", "kind": "network_error", "message": "..."}
//! ```

use std::process::Stdio;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::*;
use crate::config::CommandSpec;

#[derive(Debug, Serialize)]
struct Invocation<'a, T: Serialize> {
    operation: &'a str,
    request: &'a T,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Envelope {
    Ok {
        #[serde(default)]
        result: serde_json::Value,
    },
    Error {
        kind: CollaboratorErrorKind,
        message: String,
    },
}

#[derive(Debug, Deserialize)]
struct GenerateResult {
    files: Vec<GeneratedFile>,
}

/// Runs an external command per collaborator call.
#[derive(Debug, Clone)]
pub struct ProcessCollaborator {
    command: CommandSpec,
}

impl ProcessCollaborator {
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }

    async fn invoke<Req, Resp>(&self, operation: &str, request: &Req) -> CollaboratorResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_vec(&Invocation { operation, request }).map_err(|e| {
            CollaboratorError::new(
                CollaboratorErrorKind::InvalidResponse,
                format!("failed to encode {operation} request: {e}"),
            )
        })?;

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .envs(&self.command.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CollaboratorError::new(
                    CollaboratorErrorKind::Spawn,
                    format!("failed to spawn {}: {e}", self.command.program),
                )
            })?;

        let stdin = child.stdin.take();
        let write = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&payload).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (written, output) = tokio::join!(write, child.wait_with_output());
        if let Err(e) = written {
            tracing::debug!(operation, error = %e, "collaborator closed stdin early");
        }
        let output = output.map_err(|e| {
            CollaboratorError::new(
                CollaboratorErrorKind::Unreachable,
                format!("{operation} collaborator did not complete: {e}"),
            )
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let envelope: Option<Envelope> = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .and_then(|l| serde_json::from_str(l).ok());

        match envelope {
            Some(Envelope::Ok { result }) => serde_json::from_value(result).map_err(|e| {
                CollaboratorError::new(
                    CollaboratorErrorKind::InvalidResponse,
                    format!("{operation} result has unexpected shape: {e}"),
                )
            }),
            Some(Envelope::Error { kind, message }) => Err(CollaboratorError::new(kind, message)),
            None if !output.status.success() => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                Err(CollaboratorError::rejected(format!(
                    "{operation} collaborator exited with {}: {stderr}",
                    output.status
                )))
            }
            None => Err(CollaboratorError::new(
                CollaboratorErrorKind::InvalidResponse,
                format!("{operation} collaborator printed no response envelope"),
            )),
        }
    }
}

#[async_trait]
impl Analyzer for ProcessCollaborator {
    async fn analyze(&self, snapshot: &WorkspaceSnapshot) -> CollaboratorResult<AnalysisOutput> {
        self.invoke("analyze", snapshot).await
    }
}

#[async_trait]
impl EnvironmentPreparer for ProcessCollaborator {
    async fn prepare(
        &self,
        snapshot: &WorkspaceSnapshot,
    ) -> CollaboratorResult<EnvironmentDescriptor> {
        self.invoke("prepare", snapshot).await
    }
}

#[async_trait]
impl Generator for ProcessCollaborator {
    async fn generate(&self, request: &GenerationRequest) -> CollaboratorResult<Vec<GeneratedFile>> {
        let result: GenerateResult = self.invoke("generate", request).await?;
        Ok(result.files)
    }
}

#[async_trait]
impl Validator for ProcessCollaborator {
    async fn run_and_validate(
        &self,
        request: &ValidationRequest,
    ) -> CollaboratorResult<ValidationOutput> {
        self.invoke("run_and_validate", request).await
    }
}

#[async_trait]
impl RepairAdvisor for ProcessCollaborator {
    async fn propose_repair(&self, request: &RepairRequest) -> CollaboratorResult<RepairProposal> {
        self.invoke("propose_repair", request).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> ProcessCollaborator {
        ProcessCollaborator::new(CommandSpec {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            env: Default::default(),
        })
    }

    fn snapshot() -> WorkspaceSnapshot {
        WorkspaceSnapshot {
            repo_name: "widget".into(),
            commit_ref: "abc".into(),
            source_dir: "/tmp/widget".into(),
        }
    }

    #[tokio::test]
    async fn test_ok_envelope() {
        let collab = shell(
            r#"cat >/dev/null; echo '{"status":"ok","result":{"capabilities":[],"entry_points":["main"]}}'"#,
        );
        let out = collab.analyze(&snapshot()).await.unwrap();
        assert_eq!(out.entry_points, vec!["main".to_string()]);
    }

    #[tokio::test]
    async fn test_request_reaches_stdin() {
        let collab = shell(
            r#"grep -q '"operation":"prepare"' && echo '{"status":"ok","result":{"kind":"venv"}}'"#,
        );
        let env = collab.prepare(&snapshot()).await.unwrap();
        assert_eq!(env.kind, "venv");
    }

    #[tokio::test]
    async fn test_error_envelope_keeps_kind() {
        let collab = shell(
            r#"cat >/dev/null; echo '{"status":"error","kind":"network_error","message":"pip index down"}'"#,
        );
        let err = collab.prepare(&snapshot()).await.unwrap_err();
        assert_eq!(err.kind, CollaboratorErrorKind::NetworkError);
        assert_eq!(err.message, "pip index down");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_rejected() {
        let collab = shell("cat >/dev/null; echo broken >&2; exit 3");
        let err = collab.analyze(&snapshot()).await.unwrap_err();
        assert_eq!(err.kind, CollaboratorErrorKind::Rejected);
        assert!(err.message.contains("broken"));
    }

    #[tokio::test]
    async fn test_garbage_is_invalid_response() {
        let collab = shell("cat >/dev/null; echo not-json");
        let err = collab.analyze(&snapshot()).await.unwrap_err();
        assert_eq!(err.kind, CollaboratorErrorKind::InvalidResponse);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let collab = ProcessCollaborator::new(CommandSpec {
            program: "/nonexistent/collaborator".into(),
            args: vec![],
            env: Default::default(),
        });
        let err = collab.analyze(&snapshot()).await.unwrap_err();
        assert_eq!(err.kind, CollaboratorErrorKind::Spawn);
    }
}
