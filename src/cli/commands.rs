//! CLI command definitions for lead-forge.
//!
//! `run` executes one lead-research run and prints its report; `status`,
//! `show` and `purge` inspect and clean up run workspaces on disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing::{info, warn};

use crate::agents::{LlmResearchAgent, LlmResearchConfig, LlmStructurer};
use crate::config::{parse_agent_list, ForgeConfig};
use crate::error::ErrorKind;
use crate::intake::{IntakeConstraints, KeywordQueryPlanner, LlmQueryPlanner, QueryPlanner};
use crate::llm::{LiteLlmClient, LlmProvider};
use crate::metrics::LeadMetrics;
use crate::run::progress::read_snapshot;
use crate::run::{
    ErrorLogEntry, ProgressSnapshot, RunController, RunId, RunReport, RunRequest, RunStatus,
    RunSummary, ERRORS_FILE, METRICS_FILE,
};
use crate::store::ConsolidationStore;
use crate::workspace::{outputs_dir, run_dir, WorkspaceManager, LOCK_FILE};

/// Concurrent lead-research pipeline.
#[derive(Parser)]
#[command(name = "lead-forge")]
#[command(about = "Research business leads across LinkedIn, Facebook, websites and maps")]
#[command(version)]
#[command(
    long_about = "lead-forge fans search queries out across research agents, validates what they find and appends the leads to one consolidated JSON file per run.\n\nExample usage:\n  lead-forge run --query \"dental clinic austin tx\" --agents website,gmap\n  lead-forge run --constraints intake.json --planner keywords\n  lead-forge show run_20261018T101500_1a2b3c4d"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file.
    #[arg(long, env = "LEADFORGE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding run workspaces (overrides the configuration).
    #[arg(long, global = true)]
    pub runs_dir: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Execute a lead-research run.
    Run(RunArgs),

    /// Show the state of a run workspace.
    Status(StatusArgs),

    /// Print the consolidated leads of a run.
    Show(ShowArgs),

    /// Delete unlocked run workspaces older than the purge age.
    Purge(PurgeArgs),
}

/// How intake constraints are turned into queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PlannerKind {
    /// Ask the LLM for 3-5 optimized queries.
    Llm,
    /// Deterministic keyword and location combinations.
    Keywords,
}

/// Arguments for `lead-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Intake constraints file (JSON or YAML).
    #[arg(long, conflicts_with = "query", required_unless_present = "query")]
    pub constraints: Option<PathBuf>,

    /// Search query, used as given. Repeat for several queries.
    #[arg(short, long)]
    pub query: Vec<String>,

    /// Fixed run ID (generated when absent).
    #[arg(long)]
    pub run_id: Option<String>,

    /// Comma-separated agent kinds (linkedin,facebook,website,gmap).
    #[arg(short, long)]
    pub agents: Option<String>,

    /// Maximum stage tasks executing at once.
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Deadline of one stage task in seconds.
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Query planner for constraints files.
    #[arg(long, value_enum, default_value = "llm")]
    pub planner: PlannerKind,

    /// LLM model for research, structuring and planning.
    #[arg(short, long)]
    pub model: Option<String>,

    /// OpenRouter API key (can also be set via OPENROUTER_API_KEY).
    #[arg(long, env = "OPENROUTER_API_KEY")]
    pub api_key: Option<String>,

    /// Write Prometheus metrics to this file after the run.
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,

    /// Output JSON report.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `lead-forge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Run ID.
    pub run_id: String,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `lead-forge show`.
#[derive(Parser, Debug)]
pub struct ShowArgs {
    /// Run ID.
    pub run_id: String,

    /// Output the leads as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `lead-forge purge`.
#[derive(Parser, Debug)]
pub struct PurgeArgs {
    /// Only consider this run.
    #[arg(long)]
    pub run_id: Option<String>,

    /// Minimum age in hours (defaults to the configured purge age).
    #[arg(long)]
    pub older_than_hours: Option<u64>,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut config = ForgeConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.runs_dir {
        config = config.with_runs_dir(dir);
    }

    match cli.command {
        Commands::Run(args) => run_run_command(config, args).await,
        Commands::Status(args) => run_status_command(&config, args).await,
        Commands::Show(args) => run_show_command(&config, args).await,
        Commands::Purge(args) => run_purge_command(&config, args).await,
    }
}

// ============================================================================
// Run Command Implementation
// ============================================================================

async fn run_run_command(mut config: ForgeConfig, args: RunArgs) -> anyhow::Result<()> {
    if let Some(agents) = args.agents.as_deref() {
        config = config.with_agent_kinds(parse_agent_list(agents, "--agents")?);
    }
    if let Some(concurrency) = args.concurrency {
        config = config.with_max_concurrency(concurrency);
    }
    if let Some(secs) = args.timeout_secs {
        config = config.with_stage_timeout(Duration::from_secs(secs));
    }
    if let Some(model) = args.model.clone() {
        config = config.with_model(model);
    }
    if let Some(key) = args.api_key.clone() {
        config = config.with_api_key(key);
    }
    config.validate()?;

    let request = build_request(&args)?;

    let Some(api_key) = config.api_key.clone() else {
        anyhow::bail!(
            "OPENROUTER_API_KEY is required but not set.\n\
             Provide it via --api-key <KEY> or set the OPENROUTER_API_KEY environment variable."
        );
    };

    let llm_client: Arc<dyn LlmProvider> = Arc::new(LiteLlmClient::new(
        config.api_base.clone(),
        Some(api_key),
        config.model.clone(),
    )?);
    info!(model = %config.model, "Using LLM provider");

    let agent = Arc::new(LlmResearchAgent::new(
        llm_client.clone(),
        LlmResearchConfig {
            model: config.model.clone(),
            ..Default::default()
        },
    ));
    let structurer = Arc::new(LlmStructurer::new(llm_client.clone(), config.model.clone()));
    let planner: Arc<dyn QueryPlanner> = match args.planner {
        PlannerKind::Llm => Arc::new(LlmQueryPlanner::new(llm_client, config.model.clone())),
        PlannerKind::Keywords => Arc::new(KeywordQueryPlanner::new()),
    };

    let metrics = Arc::new(LeadMetrics::new()?);
    let controller = Arc::new(
        RunController::new(config, agent, structurer, planner).with_metrics(metrics.clone()),
    );

    match controller.purge(None).await {
        Ok(0) => {}
        Ok(purged) => info!(purged, "Purged stale run workspaces"),
        Err(e) => warn!(error = %e, "Failed to purge stale run workspaces"),
    }

    let handle = controller.submit(request).await?;
    let run_id = handle.run_id().clone();
    info!(run_id = %run_id, "Run started, press Ctrl-C to cancel");

    let interrupt = {
        let controller = controller.clone();
        let run_id = run_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(run_id = %run_id, "Interrupt received, cancelling run");
                if let Err(e) = controller.cancel(&run_id).await {
                    warn!(error = %e, "Failed to cancel run");
                }
            }
        })
    };

    let report = handle.wait().await?;
    interrupt.abort();

    if let Some(path) = &args.metrics_out {
        fs::write(path, metrics.export())?;
        info!(path = %path.display(), "Metrics written");
    }

    if args.json {
        let json_output = serde_json::to_string_pretty(&report)
            .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
        println!("{}", json_output);
    } else {
        print_report(&report);
    }

    if report.run.status == RunStatus::Failed {
        anyhow::bail!("Run {} failed", report.run.id);
    }
    Ok(())
}

fn build_request(args: &RunArgs) -> anyhow::Result<RunRequest> {
    let mut request = match &args.constraints {
        Some(path) => RunRequest::from_constraints(read_constraints(path)?),
        None => RunRequest::from_queries(args.query.iter().cloned()),
    };
    if let Some(id) = &args.run_id {
        request = request.with_run_id(RunId::parse(id.as_str())?);
    }
    Ok(request)
}

fn read_constraints(path: &Path) -> anyhow::Result<IntakeConstraints> {
    let content = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let constraints = if is_yaml {
        serde_yaml::from_str(&content)?
    } else {
        serde_json::from_str(&content)?
    };
    Ok(constraints)
}

fn print_report(report: &RunReport) {
    let summary = &report.summary;
    let marker = match report.run.status {
        RunStatus::Completed => "✓",
        RunStatus::PartiallyFailed | RunStatus::Cancelled => "!",
        _ => "✗",
    };
    println!("{} Run {} {}", marker, report.run.id, report.run.status);
    println!("  Workspace: {}", report.run.workspace.display());
    println!(
        "  Tasks: {} total, {} succeeded, {} failed",
        summary.total_tasks, summary.successful_tasks, summary.failed_tasks
    );
    println!(
        "  Leads: {} consolidated, {} with contact info",
        summary.records_consolidated, summary.records_with_contact
    );
    println!("  Elapsed: {:.1}s", summary.elapsed_secs);
    println!("  Output: {}", report.consolidated_path.display());

    for kind in [
        ErrorKind::Timeout,
        ErrorKind::ProviderError,
        ErrorKind::Invalid,
        ErrorKind::Cancelled,
        ErrorKind::IoFailure,
    ] {
        let count = report.count_errors(kind);
        if count > 0 {
            println!("    {}: {}", kind, count);
        }
    }
}

// ============================================================================
// Inspection Commands
// ============================================================================

/// Workspace state as seen on disk.
#[derive(Debug, Serialize)]
struct WorkspaceStatus {
    run_id: RunId,
    state: &'static str,
    workspace: PathBuf,
    progress: Option<ProgressSnapshot>,
    summary: Option<RunSummary>,
    errors: usize,
}

async fn run_status_command(config: &ForgeConfig, args: StatusArgs) -> anyhow::Result<()> {
    let run_id = RunId::parse(args.run_id.as_str())?;
    let workspace = run_dir(&config.runs_dir, &run_id);
    if !tokio::fs::try_exists(&workspace).await? {
        anyhow::bail!("Run {} not found under {}", run_id, config.runs_dir.display());
    }

    let outputs = outputs_dir(&config.runs_dir, &run_id);
    let locked = tokio::fs::try_exists(workspace.join(LOCK_FILE)).await?;
    let summary: Option<RunSummary> = read_json(&outputs.join(METRICS_FILE)).await;
    let errors: Vec<ErrorLogEntry> = read_json(&outputs.join(ERRORS_FILE))
        .await
        .unwrap_or_default();

    let state = match (locked, summary.is_some()) {
        (true, _) => "running",
        (false, true) => "finished",
        (false, false) => "abandoned",
    };
    let status = WorkspaceStatus {
        run_id,
        state,
        workspace,
        progress: read_snapshot(outputs).await,
        summary,
        errors: errors.len(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Run {}: {}", status.run_id, status.state);
    println!("  Workspace: {}", status.workspace.display());
    if let Some(progress) = &status.progress {
        println!(
            "  Progress: {}/{} tasks, {} in flight, {} leads (updated {})",
            progress.completed,
            progress.tasks_total,
            progress.in_flight,
            progress.records,
            progress.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(summary) = &status.summary {
        println!(
            "  Result: {} leads from {} tasks ({} failed) in {:.1}s",
            summary.records_consolidated,
            summary.total_tasks,
            summary.failed_tasks,
            summary.elapsed_secs
        );
    }
    if status.errors > 0 {
        println!("  Errors logged: {}", status.errors);
    }
    Ok(())
}

async fn run_show_command(config: &ForgeConfig, args: ShowArgs) -> anyhow::Result<()> {
    let run_id = RunId::parse(args.run_id.as_str())?;
    let store = ConsolidationStore::new(config.runs_dir.clone(), config.backup_retention);
    let leads = store.read(&run_id).await?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({ "leads": leads }))?
        );
        return Ok(());
    }

    if leads.is_empty() {
        println!("No leads found.");
        return Ok(());
    }

    println!("{} leads in {}", leads.len(), store.path(&run_id).display());
    for lead in &leads {
        println!(
            "  [{}] {} | {} | {} | {}",
            lead.source(),
            lead.company(),
            lead.website(),
            lead.email(),
            lead.phone()
        );
    }
    Ok(())
}

async fn run_purge_command(config: &ForgeConfig, args: PurgeArgs) -> anyhow::Result<()> {
    let run_id = args
        .run_id
        .as_deref()
        .map(RunId::parse)
        .transpose()?;
    let older_than = args
        .older_than_hours
        .map(|h| Duration::from_secs(h * 3600))
        .unwrap_or(config.purge_age);

    let manager = WorkspaceManager::new(config.runs_dir.clone());
    let removed = manager.purge(run_id.as_ref(), older_than).await?;
    println!("Purged {} run workspace(s)", removed);
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    serde_json::from_str(&content).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_with_queries() {
        let cli = Cli::try_parse_from([
            "lead-forge",
            "run",
            "-q",
            "dental clinic austin",
            "-q",
            "orthodontist austin",
            "--agents",
            "website,gmap",
            "--concurrency",
            "2",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.query.len(), 2);
                assert_eq!(args.agents.as_deref(), Some("website,gmap"));
                assert_eq!(args.concurrency, Some(2));
                assert_eq!(args.planner, PlannerKind::Llm);
                assert!(!args.json);

                let request = build_request(&args).expect("request");
                assert!(request.run_id.is_none());
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_requires_queries_or_constraints() {
        assert!(Cli::try_parse_from(["lead-forge", "run"]).is_err());
        assert!(Cli::try_parse_from([
            "lead-forge",
            "run",
            "--constraints",
            "intake.json",
            "-q",
            "dental clinic"
        ])
        .is_err());
    }

    #[test]
    fn test_run_id_is_validated() {
        let cli = Cli::try_parse_from([
            "lead-forge",
            "run",
            "-q",
            "dental clinic",
            "--run-id",
            "../escape",
        ])
        .expect("should parse");
        match cli.command {
            Commands::Run(args) => assert!(build_request(&args).is_err()),
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_constraints_file_formats() {
        let dir = tempfile::tempdir().expect("tempdir");
        let json_path = dir.path().join("intake.json");
        fs::write(
            &json_path,
            r#"{"project": "dental", "targets": {"keywords": ["dental clinic"], "locations": ["austin"]}}"#,
        )
        .expect("write");
        let yaml_path = dir.path().join("intake.yaml");
        fs::write(
            &yaml_path,
            "project: dental\ntargets:\n  keywords: dental clinic\n  locations: [austin]\n",
        )
        .expect("write");

        let from_json = read_constraints(&json_path).expect("json");
        let from_yaml = read_constraints(&yaml_path).expect("yaml");
        assert_eq!(from_json, from_yaml);
    }

    #[test]
    fn test_purge_command_defaults() {
        let cli = Cli::try_parse_from(["lead-forge", "purge"]).expect("should parse");
        match cli.command {
            Commands::Purge(args) => {
                assert!(args.run_id.is_none());
                assert!(args.older_than_hours.is_none());
            }
            _ => panic!("Expected Purge command"),
        }
    }
}
