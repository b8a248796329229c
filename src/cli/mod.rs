mod config;

pub use config::{
    DEFAULT_CONFIG_FILE, DEFAULT_STORE_DIR, DetailflowConfig, ENV_DEFAULT_PARALLELISM,
    ENV_HIGH_PARALLELISM, ENV_LOW_PARALLELISM,
};

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::engine::WorkPools;
use crate::engine::types::{RunStatus, StepStatus, WorkflowRun};
use crate::storage::Journal;
use crate::storage::json_store::JsonJournal;

#[derive(Parser)]
#[command(
    name = "detailflow",
    version,
    about = "Inspect durable workflow runs of the detailing shop"
)]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to the config file (default: auto-detect detailflow.yaml in cwd)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Journal directory (overrides the config file)
    #[arg(long, global = true, env = "DETAILFLOW_STORE_DIR")]
    store_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List journaled workflow runs
    Runs {
        /// Filter by status (running, completed, failed, canceled)
        #[arg(short, long)]
        status: Option<String>,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Inspect a specific run
    Inspect {
        /// Run ID
        run_id: String,
    },

    /// Show the resolved pool limits
    Pools,
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load .env before config so env overrides apply
    load_dotenv(cli.dotenv.as_deref());

    let config = DetailflowConfig::load(cli.config.as_deref())?;
    let store_dir = config.store_dir(cli.store_dir.as_deref());

    match cli.command {
        Commands::Runs { status, format } => cmd_runs(status, store_dir, format).await,
        Commands::Inspect { run_id } => cmd_inspect(run_id, store_dir).await,
        Commands::Pools => cmd_pools(&config),
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (warn if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&std::path::Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

async fn cmd_runs(status_filter: Option<String>, store_dir: PathBuf, format: String) -> Result<()> {
    let journal = JsonJournal::new(store_dir);

    let status = status_filter
        .as_deref()
        .map(str::parse::<RunStatus>)
        .transpose()?;

    let runs = journal.list_runs(status).await?;

    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    println!(
        "{:<38} {:<22} {:<8} {:<10} {:<6} {:<20}",
        "RUN ID", "WORKFLOW", "POOL", "STATUS", "STEPS", "CREATED"
    );
    println!("{}", "-".repeat(108));

    for run in &runs {
        println!(
            "{:<38} {:<22} {:<8} {:<10} {:<6} {:<20}",
            run.id,
            run.definition_name,
            run.pool,
            run.status,
            run.cursor,
            run.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("\nTotal: {} run(s)", runs.len());
    Ok(())
}

async fn cmd_inspect(run_id: String, store_dir: PathBuf) -> Result<()> {
    let journal = JsonJournal::new(store_dir);

    let run = journal
        .get_run(&run_id)
        .await
        .with_context(|| format!("Run '{}' not found", run_id))?;

    print_run(&run);
    println!("\n{}", serde_json::to_string_pretty(&run)?);

    Ok(())
}

fn print_run(run: &WorkflowRun) {
    println!("Run:      {}", run.id);
    println!("Workflow: {} [{}]", run.definition_name, run.pool);
    println!("Status:   {}", run.status);
    println!("Cursor:   {}", run.cursor);
    if let Some(ref on_complete) = run.on_complete {
        println!(
            "Callback: {} (fired: {})",
            on_complete.handler, run.on_complete_fired
        );
    }

    println!("\nHistory:");
    for entry in &run.step_history {
        let icon = match entry.status {
            StepStatus::Succeeded => "✓",
            StepStatus::Failed => "✗",
            StepStatus::Pending => "○",
        };
        println!(
            "  {} step {} (attempt {})",
            icon, entry.step_index, entry.attempt
        );
        if let Some(finished) = entry.finished_at {
            let duration = finished - entry.started_at;
            println!("    Duration: {}ms", duration.num_milliseconds());
        }
        if let Some(ref err) = entry.error {
            println!("    Error: {}", err);
        }
    }
}

fn cmd_pools(config: &DetailflowConfig) -> Result<()> {
    let pools = WorkPools::new(config.pool_config()?);

    println!("{:<10} MAX PARALLELISM", "POOL");
    println!("{}", "-".repeat(28));
    for stats in pools.stats() {
        println!("{:<10} {}", stats.name, stats.max_parallelism);
    }

    if let Some(timeout) = config.step_timeout() {
        println!("\nDefault step timeout: {}s", timeout.as_secs());
    }
    Ok(())
}
