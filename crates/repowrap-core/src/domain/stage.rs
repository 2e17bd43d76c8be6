//! Pipeline stage definitions.

use serde::{Deserialize, Serialize};

/// The fixed pipeline stages, declared in execution order.
///
/// The derived `Ord` follows declaration order, so `a < b` means `a` runs
/// before `b`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Clone the source repository into the run workspace.
    Download,

    /// Inspect the snapshot and describe what can be exposed.
    Analyze,

    /// Install dependencies and describe the resulting environment.
    PrepareEnvironment,

    /// Produce adapter/service source files.
    Generate,

    /// Run the generated service and collect diagnostics.
    ExecuteAndValidate,

    /// Re-validate and repair until no diagnostics remain.
    ReviewAndRepair,

    /// Copy the reviewed file set to the output location.
    Finalize,
}

impl StageName {
    /// All stages in pipeline order.
    pub const ALL: [StageName; 7] = [
        StageName::Download,
        StageName::Analyze,
        StageName::PrepareEnvironment,
        StageName::Generate,
        StageName::ExecuteAndValidate,
        StageName::ReviewAndRepair,
        StageName::Finalize,
    ];

    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            StageName::Download => "download",
            StageName::Analyze => "analyze",
            StageName::PrepareEnvironment => "prepare_environment",
            StageName::Generate => "generate",
            StageName::ExecuteAndValidate => "execute_and_validate",
            StageName::ReviewAndRepair => "review_and_repair",
            StageName::Finalize => "finalize",
        }
    }

    /// Position in the pipeline, starting at 0.
    pub fn index(&self) -> u32 {
        *self as u32
    }

    /// The initial stage of every run.
    pub fn first() -> Self {
        StageName::Download
    }

    /// The stage that follows this one, or `None` for the last stage.
    pub fn next(&self) -> Option<StageName> {
        Self::ALL.get(self.index() as usize + 1).copied()
    }

    /// Whether semantic failures of this stage may be handed to the repair
    /// collaborator.
    pub fn is_repairable(&self) -> bool {
        matches!(
            self,
            StageName::Generate | StageName::ExecuteAndValidate | StageName::ReviewAndRepair
        )
    }

    /// Upstream outputs an attempt of this stage needs before it may start.
    pub fn required_inputs(&self) -> &'static [StageName] {
        match self {
            StageName::Download => &[],
            StageName::Analyze => &[StageName::Download],
            StageName::PrepareEnvironment => &[StageName::Download],
            StageName::Generate => &[StageName::Download, StageName::Analyze],
            StageName::ExecuteAndValidate => &[StageName::PrepareEnvironment, StageName::Generate],
            StageName::ReviewAndRepair => &[
                StageName::PrepareEnvironment,
                StageName::Generate,
                StageName::ExecuteAndValidate,
            ],
            StageName::Finalize => &[StageName::ReviewAndRepair],
        }
    }

    /// Default per-attempt timeout in seconds, roughly proportional to the
    /// stage's cost.
    pub fn default_timeout_secs(&self) -> u64 {
        match self {
            StageName::Download => 600,
            StageName::Analyze => 300,
            StageName::PrepareEnvironment => 1800,
            StageName::Generate => 600,
            StageName::ExecuteAndValidate => 300,
            StageName::ReviewAndRepair => 600,
            StageName::Finalize => 60,
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for StageName {
    type Err = String;

    /// Accepts snake_case and kebab-case spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|stage| stage.name() == normalized)
            .ok_or_else(|| format!("unknown stage: {s}"))
    }
}

/// Per-stage status within a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Succeeded after at least one repair was applied.
    Repaired,
}

impl StageStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, StageStatus::Succeeded | StageStatus::Repaired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        assert_eq!(StageName::first(), StageName::Download);
        assert_eq!(StageName::Download.next(), Some(StageName::Analyze));
        assert_eq!(StageName::ReviewAndRepair.next(), Some(StageName::Finalize));
        assert_eq!(StageName::Finalize.next(), None);
        for pair in StageName::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(pair[0].next(), Some(pair[1]));
        }
    }

    #[test]
    fn test_stage_index_matches_position() {
        for (i, stage) in StageName::ALL.iter().enumerate() {
            assert_eq!(stage.index() as usize, i);
        }
    }

    #[test]
    fn test_repairable_stages() {
        let repairable: Vec<_> = StageName::ALL
            .iter()
            .filter(|s| s.is_repairable())
            .copied()
            .collect();
        assert_eq!(
            repairable,
            vec![
                StageName::Generate,
                StageName::ExecuteAndValidate,
                StageName::ReviewAndRepair
            ]
        );
    }

    #[test]
    fn test_required_inputs_precede_stage() {
        for stage in StageName::ALL {
            for required in stage.required_inputs() {
                assert!(required < &stage, "{required} must precede {stage}");
            }
        }
    }

    #[test]
    fn test_stage_from_str() {
        assert_eq!(
            "prepare-environment".parse::<StageName>().unwrap(),
            StageName::PrepareEnvironment
        );
        assert_eq!(
            "review_and_repair".parse::<StageName>().unwrap(),
            StageName::ReviewAndRepair
        );
        assert!("deploy".parse::<StageName>().is_err());
    }

    #[test]
    fn test_stage_serde_names() {
        let json = serde_json::to_string(&StageName::ExecuteAndValidate).unwrap();
        assert_eq!(json, "\"execute_and_validate\"");
    }

    #[test]
    fn test_stage_status_success() {
        assert!(StageStatus::Succeeded.is_success());
        assert!(StageStatus::Repaired.is_success());
        assert!(!StageStatus::Failed.is_success());
        assert!(!StageStatus::Pending.is_success());
    }
}
