use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use drover_core::{Orchestrator, RunStatus};
use drover_provider::openai::OpenAiCompatible;

/// An autonomous coding agent: takes one request and drives the workspace
/// toward it through planned, verified, transacted steps.
#[derive(Parser, Debug)]
#[command(name = "drover", version, about)]
struct Cli {
    /// What to do, in plain language.
    request: String,

    /// Workspace root (defaults to the current directory).
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Model name override.
    #[arg(long)]
    model: Option<String>,

    /// Maximum planner steps for this run.
    #[arg(long)]
    max_steps: Option<u32>,

    /// Auto-approve destructive operations (deletes, overwrites).
    #[arg(long)]
    auto_approve: bool,
}

const EXIT_OK: i32 = 0;
const EXIT_FAILED: i32 = 1;
const EXIT_CANCELLED: i32 = 130;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let workspace = match cli.workspace {
        Some(path) => path,
        None => std::env::current_dir().context("resolving current directory")?,
    };
    let workspace = workspace
        .canonicalize()
        .with_context(|| format!("workspace {} not found", workspace.display()))?;

    let mut config = drover_config::Config::load(&workspace)?;
    if let Some(model) = cli.model {
        config.provider.model = model;
    }
    if let Some(max_steps) = cli.max_steps {
        config.limits.max_steps = max_steps;
    }
    if cli.auto_approve {
        config.auto_approve_destructive = true;
    }

    let provider = Arc::new(OpenAiCompatible::from_config(&config.provider));
    let orchestrator = Orchestrator::new(config, provider, workspace);

    // Ctrl-C flips the cancellation flag; the loop observes it between
    // steps, before tool invocations, and on subprocess timeouts.
    let cancel = orchestrator.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ncancellation requested, shutting down...");
            cancel.cancel();
        }
    });

    let outcome = orchestrator.run(&cli.request).await?;

    let summary = &outcome.summary;
    eprintln!(
        "{}: {} tasks completed, {} failed, {} tests run ({} passed), {} files touched",
        match outcome.status {
            RunStatus::GoalAchieved => "goal achieved",
            RunStatus::BudgetExhausted => "step budget exhausted",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        },
        summary.tasks_completed.len(),
        summary.tasks_failed.len(),
        summary.tests_run,
        summary.tests_passed,
        summary.files_created.len() + summary.files_modified.len() + summary.files_deleted.len(),
    );
    if let Some(path) = &outcome.summary_path {
        eprintln!("session summary: {}", path.display());
    }

    let code = match outcome.status {
        RunStatus::GoalAchieved => EXIT_OK,
        RunStatus::Cancelled => EXIT_CANCELLED,
        RunStatus::BudgetExhausted | RunStatus::Failed => EXIT_FAILED,
    };
    std::process::exit(code);
}
