// sqlrestoretool/src/restore/logic.rs
use anyhow::{Context, Result};
use chrono::Local;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::db_restore::{
    SqlExecutor, ensure_history_index, load_restore_history, load_server_info, load_user_databases,
};
use super::discovery::{DiscoveryRequest, discover};
use super::item::{RestoreItem, RestoreStage, UnitOutcome};
use super::method::{RestoreContext, RestoreMethod, restore_method};
use super::report::{BatchReport, ReportInput, build_report};
use super::verification::{PostScripts, check_database};
use crate::config::RestoreConfig;
use crate::errors::AppError;
use crate::parallel::{
    AsyncStream, ExecutionStatus, FailMode, ParallelMonitor, ParallelizeOption, StreamedValue,
};
use crate::utils::fs::move_directory;

/// How often the units in flight are logged.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(60);

/// Cancellation of a unit, carrying the unit as far as it got.
#[derive(Debug, thiserror::Error)]
#[error("restore of {} canceled", .item.name)]
struct CanceledUnit {
    item: RestoreItem,
    #[source]
    source: AppError,
}

/// Shared by every worker of a run.
struct RunState {
    context: Arc<RestoreContext>,
    method: Arc<dyn RestoreMethod>,
    post_scripts: PostScripts,
    total: usize,
    processed: AtomicUsize,
    accumulated_us: AtomicU64,
    outcomes: Mutex<Vec<RestoreItem>>,
}

impl RunState {
    fn options(&self) -> &RestoreConfig {
        &self.context.options
    }

    /// Engine operation for one unit. Restore failures are recorded on the
    /// returned item; only cancellation comes back as an error so the engine
    /// reports the unit as canceled.
    async fn restore_unit(&self, mut item: RestoreItem, cancel: CancellationToken) -> Result<RestoreItem> {
        debug!("Starting restore for {}", item.name);
        let started = Instant::now();

        let restored = if self.options().full_only {
            self.method.restore_full(&mut item, &cancel).await
        } else {
            let start_from_full = self.context.start_from_full(&item.name);
            self.method
                .restore_full_diff_log(&mut item, start_from_full, &cancel)
                .await
        };
        let finished = match restored {
            Ok(()) => {
                let n = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
                info!("[{}/{}] OK : {} {}", n, self.total, item.name, item.stats_summary());
                self.complete(&mut item, &cancel).await
            }
            Err(e) => {
                let n = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
                if !e.is_cancelled() {
                    error!("[{}/{}] Error restoring {} : {}", n, self.total, item.name, e);
                }
                Err(e)
            }
        };
        item.elapsed = started.elapsed();

        match finished {
            Ok(()) => {
                item.set_success();
                debug!("Finished restore for {}", item.name);
            }
            Err(e) if e.is_cancelled() => {
                debug!("Restore of {} canceled at {}", item.name, item.stage);
                item.outcome = UnitOutcome::Canceled;
                return Err(CanceledUnit { item, source: e }.into());
            }
            Err(e) => item.set_error(&e),
        }
        Ok(item)
    }

    /// Steps after a successful restore: recovery, CHECKDB, post scripts,
    /// then relocation of the source folder.
    async fn complete(&self, item: &mut RestoreItem, cancel: &CancellationToken) -> Result<(), AppError> {
        let options = self.options();
        if options.run_recovery {
            item.stage = RestoreStage::Recovery;
            self.method.run_recovery(item, cancel).await?;

            if options.check_db {
                item.stage = RestoreStage::CheckDb;
                check_database(
                    self.context.executor.as_ref(),
                    &item.name,
                    options.command_timeout,
                    cancel,
                )
                .await?;
            }

            item.stage = RestoreStage::PostScript;
            if let Err(e) = self
                .post_scripts
                .run(self.context.executor.as_ref(), &item.name, cancel)
                .await
            {
                error!("[{}] Error while executing post scripts : {}", item.name, e);
                return Err(e);
            }
        }

        if let (true, Some(checked)) = (options.is_unchecked_mode(), options.checked_folder.clone()) {
            item.stage = RestoreStage::Relocation;
            let source = item.base_dir.clone();
            let moved = tokio::task::spawn_blocking(move || move_directory(&source, &checked))
                .await
                .map_err(|e| AppError::Restore(format!("relocation task failed: {}", e)))?
                .map_err(|e| {
                    error!("Error moving {} : {:?}", item.name, e);
                    AppError::from(e)
                })?;
            debug!("Moved {} to {}", item.name, moved.display());
            item.base_dir = moved;
        }
        Ok(())
    }

    fn record(&self, value: &StreamedValue<RestoreItem, RestoreItem>) {
        let item = settle(value);
        self.accumulated_us
            .fetch_add(item.elapsed.as_micros() as u64, Ordering::SeqCst);
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.push(item);
        }
    }
}

/// Final state of a unit from what the engine yielded.
fn settle(value: &StreamedValue<RestoreItem, RestoreItem>) -> RestoreItem {
    let error = value.error();
    match value.status() {
        ExecutionStatus::Succeeded => value.result().unwrap_or(&value.item).clone(),
        ExecutionStatus::Pending => value.item.clone(),
        ExecutionStatus::Canceled => {
            let mut item = error
                .and_then(|e| e.downcast_ref::<CanceledUnit>())
                .map(|canceled| canceled.item.clone())
                .unwrap_or_else(|| value.item.clone());
            item.outcome = UnitOutcome::Canceled;
            item
        }
        ExecutionStatus::Faulted => {
            let message = error.map(|e| format!("{:#}", e)).unwrap_or_default();
            warn!("Unexpected fault restoring {} : {}", value.item.name, message);
            let mut item = value.item.clone();
            item.set_error(&AppError::Restore(message));
            item
        }
    }
}

fn log_starting(options: &RestoreConfig, threads: usize) {
    let join = |paths: &[std::path::PathBuf]| {
        paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(" ")
    };
    info!("BackupFolders : {}", join(options.source_folders()));
    info!("PostScripts   : {}", join(&options.post_scripts));
    info!("FullOnly      : {}", options.full_only);
    info!("ContinueLogs  : {}", options.continue_logs);
    info!("RunRecovery   : {}", options.run_recovery);
    info!("Method        : {}", if options.stored_procedure { "sp_DatabaseRestore" } else { "native" });
    info!("Starting job on {} threads", threads);
}

/// Runs a whole restore batch and returns its report. Errors are only
/// returned for failures before any unit starts.
pub async fn perform_restore_orchestration(
    executor: Arc<dyn SqlExecutor>,
    options: RestoreConfig,
    threads: usize,
    shutdown: CancellationToken,
) -> Result<BatchReport> {
    log_starting(&options, threads);
    let run_started = Local::now().naive_local();
    let stopwatch = Instant::now();

    if let Err(e) = ensure_history_index(executor.as_ref(), &shutdown).await {
        warn!("Could not ensure the msdb restore history index: {}", e);
    }

    let request = DiscoveryRequest::from_config(&options, threads);
    let (server, databases, history, discovery) = tokio::try_join!(
        async {
            load_server_info(executor.as_ref(), &shutdown)
                .await
                .context("Failed to load server information")
        },
        async {
            load_user_databases(executor.as_ref(), &shutdown)
                .await
                .context("Failed to load databases")
        },
        async {
            load_restore_history(executor.as_ref(), &shutdown)
                .await
                .context("Failed to load restore history")
        },
        async { discover(request).await.context("Backup discovery failed") },
    )?;
    let databases = databases
        .into_iter()
        .filter(|d| !options.is_database_ignored(&d.name))
        .collect();
    let history = history
        .into_iter()
        .filter(|h| !options.is_database_ignored(&h.db_name))
        .collect();
    info!("{} directories found", discovery.items.len());

    let post_scripts = PostScripts::load(&options.post_scripts, options.post_script_filter.clone())
        .context("Failed to load post scripts")?;

    let context = Arc::new(RestoreContext::new(executor, server, databases, history, options));
    let state = Arc::new(RunState {
        method: restore_method(context.clone()),
        context,
        post_scripts,
        total: discovery.items.len(),
        processed: AtomicUsize::new(0),
        accumulated_us: AtomicU64::new(0),
        outcomes: Mutex::new(Vec::with_capacity(discovery.items.len())),
    });

    info!("Starting...");
    let monitor = Arc::new(ParallelMonitor::new(threads).context("Invalid thread count")?);
    let liveness = CancellationToken::new();
    let liveness_task = tokio::spawn(log_liveness(monitor.clone(), liveness.clone()));

    let option = ParallelizeOption {
        max_degree_of_parallelism: threads,
        fail_mode: FailMode::Smart,
    };
    let worker_state = state.clone();
    let record_state = state.clone();
    let mut stream = AsyncStream::from_iter(discovery.items.clone(), shutdown.clone())
        .parallelize_with_monitor(
            move |item, cancel| {
                let state = worker_state.clone();
                async move { state.restore_unit(item, cancel).await }
            },
            option,
            monitor,
        )
        .context("Failed to start the restore pipeline")?
        .for_each(move |value| record_state.record(value));
    while stream.next().await.is_some() {}
    let drained = stream.join().await;

    liveness.cancel();
    let _ = liveness_task.await;
    drained.context("Restore pipeline failed")?;

    let items = state
        .outcomes
        .lock()
        .map(|outcomes| outcomes.clone())
        .unwrap_or_default();
    let report = build_report(ReportInput {
        server: &state.context.server,
        options: state.options(),
        items: &items,
        missing_full: &discovery.missing_full,
        duplicates: &discovery.duplicates,
        server_databases: state.context.databases().collect(),
        started: run_started,
        now: Local::now(),
        total_time: stopwatch.elapsed(),
        accumulated: Duration::from_micros(state.accumulated_us.load(Ordering::SeqCst)),
    });
    Ok(report)
}

/// Periodically logs which units the workers are busy with.
async fn log_liveness(monitor: Arc<ParallelMonitor<RestoreItem>>, stop: CancellationToken) {
    let mut interval = tokio::time::interval(LIVENESS_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = interval.tick() => {
                let active = monitor.active();
                if !active.is_empty() {
                    let names = active
                        .iter()
                        .map(|(slot, item)| format!("{}:{}({})", slot, item.name, item.stage))
                        .collect::<Vec<_>>()
                        .join(", ");
                    debug!("In progress : {}", names);
                }
            }
        }
    }
}
