//! Orchestrator configuration.
//!
//! Loaded from TOML; every field has a default so an empty file is valid.
//!
//! ```toml
//! workspace_root = "/var/lib/repowrap/workspaces"
//! artifact_root = "/var/lib/repowrap/artifacts"
//! max_attempts = 3
//!
//! [stages.prepare_environment]
//! attempt_timeout_secs = 3600
//!
//! [collaborators.analyze]
//! program = "repowrap-analyze"
//! args = ["--json"]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{StageName, SubmitError};

/// Upper bound for any configured timeout or stage budget (one week).
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("{0}")]
    Invalid(String),
}

impl From<ConfigError> for SubmitError {
    fn from(err: ConfigError) -> Self {
        SubmitError::InvalidConfig(err.to_string())
    }
}

/// Partial per-stage override as written in the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StagePolicyOverride {
    pub max_attempts: Option<u32>,
    pub attempt_timeout_secs: Option<u64>,
    pub stage_budget_secs: Option<u64>,
}

/// Effective bounds for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    /// Wall-clock bound on all attempts and repairs of the stage
    pub stage_budget: Duration,
}

/// An external command backing a collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Commands for the process-backed collaborators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CollaboratorCommands {
    /// `git` executable used for source fetch
    pub git: Option<String>,
    pub analyze: Option<CommandSpec>,
    pub prepare: Option<CommandSpec>,
    pub generate: Option<CommandSpec>,
    pub validate: Option<CommandSpec>,
    pub repair: Option<CommandSpec>,
}

/// Per-call overrides, typically from CLI flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub max_attempts: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Parent of the per-run workspaces
    pub workspace_root: PathBuf,
    /// Root of the filesystem artifact store
    pub artifact_root: PathBuf,
    /// Copy finalized files here instead of `<workspace>/output`
    pub output_dir: Option<PathBuf>,
    pub max_attempts: u32,
    /// Applies to every stage unless a stage override sets its own
    pub attempt_timeout_secs: Option<u64>,
    /// Keyed by stage name, e.g. `generate` or `prepare_environment`
    pub stages: BTreeMap<String, StagePolicyOverride>,
    pub collaborators: CollaboratorCommands,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("repowrap").join("workspaces"),
            artifact_root: std::env::temp_dir().join("repowrap").join("artifacts"),
            output_dir: None,
            max_attempts: 3,
            attempt_timeout_secs: None,
            stages: BTreeMap::new(),
            collaborators: CollaboratorCommands::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply per-call overrides.
    pub fn apply(&mut self, options: &RunOptions) {
        if let Some(max) = options.max_attempts {
            self.max_attempts = max;
            for policy in self.stages.values_mut() {
                policy.max_attempts = None;
            }
        }
        if let Some(secs) = options.timeout_secs {
            self.attempt_timeout_secs = Some(secs);
            for policy in self.stages.values_mut() {
                policy.attempt_timeout_secs = None;
                policy.stage_budget_secs = None;
            }
        }
        if let Some(dir) = &options.output_dir {
            self.output_dir = Some(dir.clone());
        }
    }

    /// Effective policy for `stage`.
    pub fn policy(&self, stage: StageName) -> StagePolicy {
        let o = self
            .stages
            .iter()
            .find(|(name, _)| name.parse::<StageName>().ok() == Some(stage))
            .map(|(_, o)| o.clone())
            .unwrap_or_default();
        let max_attempts = o.max_attempts.unwrap_or(self.max_attempts);
        let timeout_secs = o
            .attempt_timeout_secs
            .or(self.attempt_timeout_secs)
            .unwrap_or_else(|| stage.default_timeout_secs());
        let budget_secs = o
            .stage_budget_secs
            .unwrap_or_else(|| timeout_secs.saturating_mul(u64::from(max_attempts)));
        StagePolicy {
            max_attempts,
            attempt_timeout: Duration::from_secs(timeout_secs),
            stage_budget: Duration::from_secs(budget_secs),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be >= 1".into()));
        }
        check_secs("attempt_timeout_secs", self.attempt_timeout_secs)?;
        for (stage, o) in &self.stages {
            stage.parse::<StageName>().map_err(ConfigError::Invalid)?;
            if o.max_attempts == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "stages.{stage}.max_attempts must be >= 1"
                )));
            }
            check_secs(
                &format!("stages.{stage}.attempt_timeout_secs"),
                o.attempt_timeout_secs,
            )?;
            check_secs(&format!("stages.{stage}.stage_budget_secs"), o.stage_budget_secs)?;
        }
        for (role, spec) in [
            ("analyze", &self.collaborators.analyze),
            ("prepare", &self.collaborators.prepare),
            ("generate", &self.collaborators.generate),
            ("validate", &self.collaborators.validate),
            ("repair", &self.collaborators.repair),
        ] {
            if spec.as_ref().is_some_and(|s| s.program.trim().is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "collaborators.{role}.program must not be empty"
                )));
            }
        }
        Ok(())
    }

    /// Snapshot stored with the run record.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn check_secs(field: &str, value: Option<u64>) -> Result<(), ConfigError> {
    match value {
        Some(0) => Err(ConfigError::Invalid(format!("{field} must be > 0"))),
        Some(secs) if secs > MAX_TIMEOUT_SECS => Err(ConfigError::Invalid(format!(
            "{field} must be <= {MAX_TIMEOUT_SECS}"
        ))),
        _ => Ok(()),
    }
}
