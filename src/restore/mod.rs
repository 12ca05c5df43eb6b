mod backup_file;
pub(crate) mod db_restore; // sqlcmd executor and catalog queries
mod discovery;
mod item;
mod logic;
mod method;
mod native;
mod procedure;
mod report;
pub(crate) mod verification; // CHECKDB and post scripts

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::AppConfig;
use db_restore::{ConnectionTarget, SqlCmdExecutor};

pub use report::{BatchReport, ReportStatus};

#[cfg(test)]
pub use db_restore::{DatabaseInfo, DatabaseState, ServerInfo};
#[cfg(test)]
pub use item::MissingFullBackup;
#[cfg(test)]
pub use report::{ErrorEntry, RestoredEntry};

/// Public entry point for a restore batch against the configured server.
pub async fn run_restore_flow(app_config: &AppConfig, shutdown: CancellationToken) -> Result<BatchReport> {
    app_config.restore.validate()?;

    let target = ConnectionTarget::parse(&app_config.target_db_url)
        .context("Invalid target database URL")?;
    info!("Target server : {}", target.server_argument());
    let executor = SqlCmdExecutor::new(target, app_config.trust_server_certificate)
        .context("Failed to prepare the sqlcmd client")?;

    logic::perform_restore_orchestration(
        Arc::new(executor),
        app_config.restore.clone(),
        app_config.threads,
        shutdown,
    )
    .await
}
