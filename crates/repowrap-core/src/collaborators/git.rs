//! Git-backed source fetch.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

use super::{CollaboratorError, CollaboratorErrorKind, CollaboratorResult, SourceFetcher};

/// Clones repositories with the `git` command line.
#[derive(Debug, Clone)]
pub struct GitSourceFetcher {
    program: String,
    /// Shallow clone depth; `None` clones full history
    depth: Option<u32>,
}

impl Default for GitSourceFetcher {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
            depth: Some(1),
        }
    }
}

impl GitSourceFetcher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn with_depth(mut self, depth: Option<u32>) -> Self {
        self.depth = depth;
        self
    }

    async fn git(&self, args: &[&str], dir: Option<&Path>) -> CollaboratorResult<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        let output = cmd.output().await.map_err(|e| {
            CollaboratorError::new(
                CollaboratorErrorKind::Spawn,
                format!("failed to run {}: {e}", self.program),
            )
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(CollaboratorError::new(
                classify_stderr(&stderr),
                format!("git {} failed: {stderr}", args.first().unwrap_or(&"")),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Map git's stderr onto a collaborator error kind.
pub fn classify_stderr(stderr: &str) -> CollaboratorErrorKind {
    let msg = stderr.to_lowercase();
    if msg.contains("authentication failed")
        || msg.contains("could not read username")
        || msg.contains("permission denied")
        || msg.contains("terminal prompts disabled")
    {
        return CollaboratorErrorKind::AuthRequired;
    }
    if msg.contains("repository not found")
        || msg.contains("does not exist")
        || msg.contains("not found")
        || msg.contains("does not appear to be a git repository")
    {
        return CollaboratorErrorKind::NotFound;
    }
    if msg.contains("could not resolve host")
        || msg.contains("unable to access")
        || msg.contains("connection")
        || msg.contains("timed out")
        || msg.contains("early eof")
        || msg.contains("remote end hung up")
    {
        return CollaboratorErrorKind::NetworkError;
    }
    CollaboratorErrorKind::Rejected
}

#[async_trait]
impl SourceFetcher for GitSourceFetcher {
    async fn fetch(&self, locator: &str, destination: &Path) -> CollaboratorResult<String> {
        let dest = destination.to_string_lossy().to_string();
        let depth = self.depth.map(|d| d.to_string());
        let mut args = vec!["clone", "--quiet"];
        if let Some(depth) = depth.as_deref() {
            args.extend(["--depth", depth]);
        }
        args.extend(["--", locator, dest.as_str()]);
        self.git(&args, None).await?;

        let sha = self.git(&["rev-parse", "HEAD"], Some(destination)).await?;
        if sha.is_empty() {
            return Err(CollaboratorError::new(
                CollaboratorErrorKind::InvalidResponse,
                "git rev-parse HEAD returned empty output",
            ));
        }
        tracing::debug!(locator = %locator, commit = %sha, "repository cloned");
        Ok(sha)
    }
}
