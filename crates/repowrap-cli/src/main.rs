//! repowrap - turn a source repository into a runnable service wrapper
//!
//! ## Commands
//!
//! - `submit`: run the full pipeline for one repository
//! - `report`: print the stored report of a run
//! - `runs`: list known runs
//!
//! Exit codes: 0 completed, 1 run failed, 2 rejected input, 3 internal error.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};

use repowrap_core::collaborators::{
    Analyzer, CollaboratorError, CollaboratorResult, EnvironmentPreparer, GenerationRequest,
    Generator, RepairAdvisor, RepairProposal, RepairRequest, ValidationRequest, Validator,
    WorkspaceSnapshot,
};
use repowrap_core::domain::{AnalysisOutput, EnvironmentDescriptor, GeneratedFile, ValidationOutput};
use repowrap_core::{
    CommandSpec, Collaborators, FailureKind, FinalReport, GitSourceFetcher, OrchestratorConfig,
    ProcessCollaborator, RunCoordinator, RunOptions, RunStatus, SubmitError,
};
use repowrap_state::{FsArtifactStore, RunId};

const EXIT_FAILED: u8 = 1;
const EXIT_INVALID: u8 = 2;
const EXIT_INTERNAL: u8 = 3;

#[derive(Parser)]
#[command(name = "repowrap")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Wrap a source repository as a runnable service", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Orchestrator config file (TOML)
    #[arg(short, long, global = true, env = "REPOWRAP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline for a repository and print its report
    Submit {
        /// Repository URL, local path or owner/name shorthand
        locator: String,

        /// Attempts per stage, retries and repairs included
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Timeout of a single stage attempt
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Directory for the finalized service files
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Parent directory of per-run workspaces
        #[arg(long)]
        workspace: Option<PathBuf>,

        /// Print the full report as JSON instead of a summary
        #[arg(long)]
        report_json: bool,
    },

    /// Print the stored report of a run
    Report {
        run_id: String,

        /// Print JSON instead of a summary
        #[arg(long)]
        raw: bool,
    },

    /// List runs in the artifact store
    Runs,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    repowrap_core::init_tracing(cli.json, level);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_INTERNAL)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return Ok(ExitCode::from(EXIT_INVALID));
        }
    };

    match cli.command {
        Commands::Submit {
            locator,
            max_attempts,
            timeout_secs,
            output,
            workspace,
            report_json,
        } => {
            if let Some(dir) = workspace {
                config.workspace_root = dir;
            }
            let options = RunOptions {
                max_attempts,
                timeout_secs,
                output_dir: output,
            };
            cmd_submit(config, &locator, &options, report_json).await
        }
        Commands::Report { run_id, raw } => cmd_report(config, &run_id, raw).await,
        Commands::Runs => cmd_runs(config).await,
    }
}

fn load_config(path: Option<&Path>) -> std::result::Result<OrchestratorConfig, SubmitError> {
    match path {
        Some(path) => Ok(OrchestratorConfig::load(path)?),
        None => Ok(OrchestratorConfig::default()),
    }
}

fn coordinator(config: OrchestratorConfig) -> Result<RunCoordinator> {
    let store = FsArtifactStore::new(&config.artifact_root).with_context(|| {
        format!(
            "Failed to open artifact store at {}",
            config.artifact_root.display()
        )
    })?;
    let collaborators = build_collaborators(&config);
    Ok(RunCoordinator::new(Arc::new(store), collaborators, config))
}

fn build_collaborators(config: &OrchestratorConfig) -> Collaborators {
    let commands = &config.collaborators;
    let fetcher = match &commands.git {
        Some(program) => GitSourceFetcher::new(program.clone()),
        None => GitSourceFetcher::default(),
    };
    let unconfigured = |role: &'static str| {
        warn!(role, "no command configured");
        Arc::new(Unconfigured { role })
    };
    let process = |spec: &CommandSpec| Arc::new(ProcessCollaborator::new(spec.clone()));

    Collaborators {
        fetcher: Arc::new(fetcher),
        analyzer: match &commands.analyze {
            Some(spec) => process(spec) as Arc<dyn Analyzer>,
            None => unconfigured("analyze"),
        },
        environment: match &commands.prepare {
            Some(spec) => process(spec) as Arc<dyn EnvironmentPreparer>,
            None => unconfigured("prepare"),
        },
        generator: match &commands.generate {
            Some(spec) => process(spec) as Arc<dyn Generator>,
            None => unconfigured("generate"),
        },
        validator: match &commands.validate {
            Some(spec) => process(spec) as Arc<dyn Validator>,
            None => unconfigured("validate"),
        },
        repair: match &commands.repair {
            Some(spec) => process(spec) as Arc<dyn RepairAdvisor>,
            None => unconfigured("repair"),
        },
    }
}

/// Stand-in for a collaborator with no configured command.
///
/// Repair answers `no_patch`; every other role rejects the call.
struct Unconfigured {
    role: &'static str,
}

impl Unconfigured {
    fn reject<T>(&self) -> CollaboratorResult<T> {
        Err(CollaboratorError::rejected(format!(
            "no {} command configured",
            self.role
        )))
    }
}

#[async_trait]
impl Analyzer for Unconfigured {
    async fn analyze(&self, _snapshot: &WorkspaceSnapshot) -> CollaboratorResult<AnalysisOutput> {
        self.reject()
    }
}

#[async_trait]
impl EnvironmentPreparer for Unconfigured {
    async fn prepare(
        &self,
        _snapshot: &WorkspaceSnapshot,
    ) -> CollaboratorResult<EnvironmentDescriptor> {
        self.reject()
    }
}

#[async_trait]
impl Generator for Unconfigured {
    async fn generate(&self, _request: &GenerationRequest) -> CollaboratorResult<Vec<GeneratedFile>> {
        self.reject()
    }
}

#[async_trait]
impl Validator for Unconfigured {
    async fn run_and_validate(
        &self,
        _request: &ValidationRequest,
    ) -> CollaboratorResult<ValidationOutput> {
        self.reject()
    }
}

#[async_trait]
impl RepairAdvisor for Unconfigured {
    async fn propose_repair(&self, _request: &RepairRequest) -> CollaboratorResult<RepairProposal> {
        Ok(RepairProposal::NoPatch)
    }
}

fn exit_code(report: &FinalReport) -> ExitCode {
    match (&report.status, &report.failure) {
        (RunStatus::Completed, _) => ExitCode::SUCCESS,
        (_, Some(f)) if f.kind == FailureKind::InternalInvariantViolation => {
            ExitCode::from(EXIT_INTERNAL)
        }
        _ => ExitCode::from(EXIT_FAILED),
    }
}

fn print_report(report: &FinalReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{}", report.render_summary());
    }
    Ok(())
}

async fn cmd_submit(
    config: OrchestratorConfig,
    locator: &str,
    options: &RunOptions,
    report_json: bool,
) -> Result<ExitCode> {
    let coordinator = Arc::new(coordinator(config)?);
    let handle = match coordinator.start(locator, options).await {
        Ok(handle) => handle,
        Err(e) if e.is_validation() => {
            eprintln!("error: {e}");
            return Ok(ExitCode::from(EXIT_INVALID));
        }
        Err(e) => return Err(e).context("Failed to start run"),
    };
    println!("{}", handle.run_id);

    let cancel = handle.cancel.clone();
    let run_id = handle.run_id.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(run_id = %run_id, "interrupt received; cancelling after the current stage");
            cancel.cancel();
        }
    });

    let report = handle.wait().await.context("Run did not finish")?;
    info!(run_id = %report.run_id, status = %report.status, "run finished");
    print_report(&report, report_json)?;
    Ok(exit_code(&report))
}

async fn cmd_report(config: OrchestratorConfig, run_id: &str, raw: bool) -> Result<ExitCode> {
    let run_id: RunId = match run_id.parse() {
        Ok(id) => id,
        Err(e) => {
            eprintln!("error: invalid run id {run_id:?}: {e}");
            return Ok(ExitCode::from(EXIT_INVALID));
        }
    };
    let coordinator = coordinator(config)?;
    let report = coordinator
        .load_report(&run_id)
        .await
        .with_context(|| format!("Failed to load report for run {run_id}"))?;
    print_report(&report, raw)?;
    Ok(ExitCode::SUCCESS)
}

async fn cmd_runs(config: OrchestratorConfig) -> Result<ExitCode> {
    let coordinator = coordinator(config)?;
    let runs = coordinator
        .store()
        .list_runs()
        .await
        .context("Failed to list runs")?;
    if runs.is_empty() {
        println!("No runs.");
    }
    for run in runs {
        let status = match coordinator.load_report(&run.run_id).await {
            Ok(report) => report.status.to_string(),
            Err(_) => RunStatus::InProgress.to_string(),
        };
        println!(
            "{}  {:<11} {}  {}",
            run.run_id,
            status,
            run.created_at.format("%Y-%m-%d %H:%M:%S"),
            run.locator
        );
    }
    Ok(ExitCode::SUCCESS)
}
