use std::path::Path;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global subscriber: console plus a daily-rolling `restore.log`
/// under `logs_path`. Keep the returned guard alive until exit so the file
/// writer flushes.
pub fn init_logger(logs_path: &Path, verbose: bool) -> WorkerGuard {
    let default_level = if verbose { "debug" } else { "info" };
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_appender = tracing_appender::rolling::daily(logs_path, "restore.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_target(false)
                .with_ansi(true),
        )
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(filter_layer)
        .init();

    info!("Logging to stdout and {}", logs_path.join("restore.log").display());

    guard
}
