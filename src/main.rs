//! # SearchSweep CLI
//!
//! Runs one clustering pass or one plan re-sync and prints the JSON summary.
//!
//! Usage:
//!   searchsweep run --parent-task-id 1024               # Cluster a search task
//!   searchsweep run --parent-task-id 1024 --dry-run     # Compute only, write nothing
//!   searchsweep group --group-id 快手_B1_u --date 2026-02-07

use anyhow::Result;
use clap::{Parser, Subcommand};
use searchsweep_core::{Day, SweepConfig, SweepError};
use searchsweep_pipeline::{Pipeline, RunSummary};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "searchsweep",
    version,
    about = "🔎 SearchSweep: post-search clustering and webhook planning"
)]
struct Cli {
    /// Config file (default ~/.searchsweep/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Cluster a parent task's captures and plan follow-ups
    Run {
        #[arg(long)]
        parent_task_id: i64,
        /// Selection threshold in [0, 1]; defaults to the configured value
        #[arg(long)]
        threshold: Option<f64>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Re-sync one group's webhook plan from the Task table
    Group {
        #[arg(long)]
        group_id: String,
        /// YYYY-MM-DD
        #[arg(long)]
        date: String,
        #[arg(long)]
        dry_run: bool,
    },
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "searchsweep={level},searchsweep_core={level},searchsweep_store={level},searchsweep_pipeline={level}"
        ))
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn execute(cli: Cli) -> Result<RunSummary> {
    let mut config = SweepConfig::load(cli.config.as_deref())?;
    config.apply_env();
    config.validate()?;

    let (records, capture) = searchsweep_store::connect(&config).await?;
    let offset = config.utc_offset();
    let pipeline = Pipeline::new(config, Arc::new(records), Arc::new(capture));

    let summary = match cli.command {
        Command::Run {
            parent_task_id,
            threshold,
            dry_run,
        } => {
            pipeline
                .dry_run(dry_run)
                .run_for_parent(parent_task_id, threshold)
                .await?
        }
        Command::Group {
            group_id,
            date,
            dry_run,
        } => {
            let day = Day::parse_ymd(&date, offset)?;
            pipeline.dry_run(dry_run).run_for_group(&group_id, day).await?
        }
    };
    Ok(summary)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_json);

    match execute(cli).await {
        Ok(summary) => match serde_json::to_string_pretty(&summary) {
            Ok(out) => {
                println!("{out}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!("❌ Failed to encode summary: {e}");
                ExitCode::from(1)
            }
        },
        Err(e) => {
            tracing::error!("❌ {e:#}");
            let config_error = e
                .downcast_ref::<SweepError>()
                .is_some_and(SweepError::is_config);
            ExitCode::from(if config_error { 2 } else { 1 })
        }
    }
}
