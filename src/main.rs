//! SQL Server Restore Tool
//!
//! Restores every database found in a set of backup folders onto one server
//! and reports what was restored, what failed and how fresh the result is.

// sqlrestoretool/src/main.rs
mod config;
mod errors;
mod notification;
mod parallel;
mod restore;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::AppConfig;
use restore::ReportStatus;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "sqlrestoretool", version, about = "Bulk SQL Server backup restore")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, global = true, default_value = "config.json")]
    config: PathBuf,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Restore every backup folder found under the configured roots
    Restore {
        /// Overrides `threads` from the configuration
        #[arg(short, long)]
        threads: Option<usize>,

        /// Only restore these databases (repeatable)
        #[arg(short, long = "database")]
        databases: Vec<String>,
    },
}

/// Main entry point for the restore tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    match run_app(cli).await {
        Ok(status) if status.contains(ReportStatus::ERROR) => ExitCode::FAILURE,
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:?}", e);
            eprintln!("Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app(cli: Cli) -> Result<ReportStatus> {
    let mut app_config = AppConfig::load_from_json(&cli.config).with_context(|| {
        format!(
            "Failed to load application configuration from {}",
            cli.config.display()
        )
    })?;

    if let Some(Command::Restore { threads, databases }) = cli.command {
        if let Some(threads) = threads {
            anyhow::ensure!(threads > 0, "--threads must be at least 1");
            app_config.threads = threads;
        }
        if !databases.is_empty() {
            app_config.restore.databases = databases;
        }
    }

    std::fs::create_dir_all(&app_config.logs_path).with_context(|| {
        format!("Failed to create logs directory {}", app_config.logs_path.display())
    })?;
    let _guard = utils::logging::init_logger(&app_config.logs_path, cli.verbose);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing units in flight and skipping the rest");
            signal.cancel();
        }
    });

    info!("Starting restore run");
    let report = restore::run_restore_flow(&app_config, shutdown)
        .await
        .context("Restore process failed")?;

    let sinks = notification::configured_sinks(&app_config.report);
    notification::notify_all(&sinks, &report, app_config.report.only_on_issue).await;

    Ok(report.status)
}
