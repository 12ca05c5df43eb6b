// sqlrestoretool/src/restore/native.rs
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::backup_file::{FULL_EXTENSION, backup_date, is_log_backup, log_stack_after, newest_file};
use super::db_restore::{DatabaseState, quote_identifier, quote_literal, server_path};
use super::item::{RestoreItem, RestoreStage};
use super::method::{RestoreContext, RestoreMethod, recover_database};
use crate::config::RestoreConfig;
use crate::errors::AppError;

const MAX_ATTEMPTS: u32 = 2;
const BUSY_RETRIES: u32 = 3;

/// Broken chain, consistency errors, missing log, exclusive access or device
/// open failures: drop the database and start over from FULL.
const RECOVERABLE_ERRORS: &[i32] = &[4305, 4319, 824, 3446, 3101, 3201];
/// Logical file name mismatch (3234) or directory lookup failure (5133).
const FILE_LIST_ERRORS: &[i32] = &[3234, 5133];
/// Backup device in use or cannot be opened yet.
const BUSY_ERRORS: &[i32] = &[3634, 3201];
/// Log terminates before the database LSN, the next file may apply.
const TOO_EARLY: i32 = 4326;
/// Log begins after the database LSN.
const TOO_RECENT: i32 = 4305;
/// Differential does not belong to the restored FULL.
const DIFF_BASE_MISMATCH: i32 = 3136;

/// Restores with plain `RESTORE DATABASE` / `RESTORE LOG` statements.
pub struct NativeRestore {
    context: Arc<RestoreContext>,
}

/// Last backup applied to the database, where the LOG chain resumes.
struct ReferencePoint {
    path: PathBuf,
    date: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LogStep {
    Apply,
    /// Re-read the file header and apply every backup set it holds.
    ExtractHeaders,
}

impl NativeRestore {
    pub fn new(context: Arc<RestoreContext>) -> Self {
        Self { context }
    }

    fn options(&self) -> &RestoreConfig {
        &self.context.options
    }

    async fn execute(&self, statement: &str, cancel: &CancellationToken) -> Result<(), AppError> {
        self.context
            .executor
            .execute(None, statement, self.options().command_timeout, cancel)
            .await?;
        Ok(())
    }

    /// Bounded retry loop around one restore pass.
    async fn restore_chain(
        &self,
        item: &mut RestoreItem,
        start_from_full: bool,
        restore_logs: bool,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let mut file_list_mode = false;
        let mut force_full = start_from_full;
        // The snapshot only describes the database until we drop it.
        let mut online = self
            .context
            .database(&item.name)
            .is_some_and(|db| db.state != DatabaseState::Restoring);

        for attempt in 1..=MAX_ATTEMPTS {
            let last_attempt = attempt == MAX_ATTEMPTS;
            let error = match self
                .restore_pass(item, force_full, file_list_mode, restore_logs, cancel)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if error.is_cancelled() {
                return Err(error);
            }
            if error.is_sql_number(RECOVERABLE_ERRORS) {
                item.stats.dropped += 1;
                debug!("{} : Error on attempt {}, retrying from scratch : {}", item.name, attempt, error);
                force_full = true;
                if let Err(drop_error) = self.drop_database(&item.name, online, cancel).await {
                    error!(
                        "Error while trying to drop db {}{} : {}",
                        item.name,
                        if online { " in SINGLE_USER mode" } else { "" },
                        drop_error
                    );
                    return Err(drop_error);
                }
                online = false;
            } else if error.is_sql_number(FILE_LIST_ERRORS) {
                debug!("{} : switching to file list mode : {}", item.name, error);
                file_list_mode = true;
            } else {
                return Err(error);
            }

            if last_attempt {
                return Err(error);
            }
        }
        Ok(())
    }

    async fn restore_pass(
        &self,
        item: &mut RestoreItem,
        force_full: bool,
        file_list_mode: bool,
        restore_logs: bool,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let continuable = !force_full
            && self
                .context
                .database(&item.name)
                .is_some_and(|db| db.state == DatabaseState::Restoring);
        let with_chain = restore_logs && !self.options().full_only;

        let reference = if continuable {
            let path = self
                .context
                .history(&item.name)
                .and_then(|h| h.last_backup_path.as_deref())
                .filter(|p| !p.is_empty())
                .ok_or_else(|| {
                    AppError::Restore(format!(
                        "{} : no full backup available and no continuable state",
                        item.name
                    ))
                })?;
            let path = PathBuf::from(path);
            let date = backup_date(&path);
            debug!("Last restore made :  path={}, date={}", path.display(), date);
            item.rpo_recent_restore = Some(date);
            ReferencePoint { path, date }
        } else {
            let mut reference = self.restore_full_file(item, file_list_mode, cancel).await?;
            if with_chain {
                if let Some(diff) = self.restore_diff(item, reference.date, cancel).await? {
                    reference = diff;
                }
            }
            reference
        };

        if with_chain {
            self.restore_logs(item, &reference, cancel).await?;
        }
        Ok(())
    }

    async fn restore_full_file(
        &self,
        item: &mut RestoreItem,
        file_list_mode: bool,
        cancel: &CancellationToken,
    ) -> Result<ReferencePoint, AppError> {
        item.stage = RestoreStage::Full;
        let (file, date) = newest_file(&item.full, FULL_EXTENSION)?
            .ok_or_else(|| AppError::NoFullBackup(item.name.clone()))?;

        let (logical_data, logical_log) = if file_list_mode {
            self.logical_names(&file, cancel).await?
        } else {
            (item.name.clone(), format!("{}_Log", item.name))
        };
        let statement = full_restore_statement(
            &item.name,
            &file,
            &logical_data,
            &logical_log,
            &server_path(&self.context.server.data_path, &format!("{}.mdf", item.name)),
            &server_path(&self.context.server.log_path, &format!("{}_log.ldf", item.name)),
            self.options(),
        );

        debug!("restoring FULL : {}", file.display());
        if let Err(e) = self.execute(&statement, cancel).await {
            debug!("{} : Error while restoring FULL with command {} : {}", item.name, statement, e);
            return Err(e);
        }
        item.stats.full += 1;
        item.rpo_recent_restore = Some(date);
        Ok(ReferencePoint { path: file, date })
    }

    /// Newest DIFF taken after the FULL. A DIFF of another base is skipped.
    async fn restore_diff(
        &self,
        item: &mut RestoreItem,
        after: NaiveDateTime,
        cancel: &CancellationToken,
    ) -> Result<Option<ReferencePoint>, AppError> {
        let Some(diff_dir) = item.diff.clone() else {
            return Ok(None);
        };
        let Some((file, date)) = newest_file(&diff_dir, FULL_EXTENSION)?.filter(|(_, d)| *d > after)
        else {
            return Ok(None);
        };

        item.stage = RestoreStage::Diff;
        debug!("restoring DIFF : {}", file.display());
        match self.execute(&diff_restore_statement(&item.name, &file, self.options()), cancel).await {
            Ok(()) => {
                item.stats.diff += 1;
                item.rpo_recent_restore = Some(date);
                Ok(Some(ReferencePoint { path: file, date }))
            }
            Err(e) if e.is_sql_number(&[DIFF_BASE_MISMATCH]) => {
                warn!("{} : DIFF {} does not match the FULL, skipping it", item.name, file.display());
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Applies every LOG newer than `reference`, oldest first.
    async fn restore_logs(
        &self,
        item: &mut RestoreItem,
        reference: &ReferencePoint,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let Some(log_dir) = item.log.clone() else {
            return Ok(());
        };
        item.stage = RestoreStage::Log;

        let mut last_log = is_log_backup(&reference.path).then(|| reference.path.clone());
        debug!("Scraping TRN files from {}", reference.date);
        let mut stack: Vec<(PathBuf, LogStep)> = log_stack_after(&log_dir, reference.date)?
            .into_iter()
            .map(|p| (p, LogStep::Apply))
            .collect();
        debug!("{} trn files to restore", stack.len());

        let mut busy_retries = BUSY_RETRIES;
        let mut reread: HashSet<PathBuf> = HashSet::new();
        while let Some((file, step)) = stack.pop() {
            debug!("restoring LOG : {}", file.display());
            let applied = match step {
                LogStep::Apply => self.apply_log(&item.name, &file, 1, cancel).await,
                LogStep::ExtractHeaders => self.apply_log_positions(&item.name, &file, cancel).await,
            };

            match applied {
                Ok(()) => {
                    busy_retries = BUSY_RETRIES;
                    if step == LogStep::Apply {
                        item.stats.log += 1;
                        item.rpo_recent_restore = Some(backup_date(&file));
                    }
                }
                Err(e) if e.is_sql_number(BUSY_ERRORS) => {
                    if busy_retries == 0 {
                        return Err(e);
                    }
                    busy_retries -= 1;
                    warn!("{} : {} busy, retrying in {:?}", item.name, file.display(), self.options().busy_retry_delay);
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(AppError::Cancelled(item.name.clone()));
                        }
                        _ = tokio::time::sleep(self.options().busy_retry_delay) => {}
                    }
                    stack.push((file, step));
                    continue;
                }
                Err(e) if e.is_sql_number(&[TOO_EARLY]) => {
                    debug!("Too early log file selected (Error 4326)[{}], retrying with next one", file.display());
                }
                Err(e) if e.is_sql_number(&[TOO_RECENT]) => {
                    let previous = last_log
                        .clone()
                        .filter(|p| reread.insert(p.clone()))
                        .ok_or_else(|| {
                            AppError::Restore(format!(
                                "log {} is too recent and no earlier log can be re-read : {}",
                                file.display(),
                                e
                            ))
                        })?;
                    debug!("{} : re-reading headers of {}", item.name, previous.display());
                    stack.push((file, LogStep::Apply));
                    stack.push((previous, LogStep::ExtractHeaders));
                    continue;
                }
                Err(e) => {
                    debug!(
                        "{} : remaining logs {} : {}",
                        item.name,
                        stack.len(),
                        stack
                            .iter()
                            .rev()
                            .map(|(p, _)| p.display().to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                    return Err(e);
                }
            }
            last_log = Some(file);
        }
        Ok(())
    }

    async fn apply_log(
        &self,
        name: &str,
        file: &Path,
        position: i64,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let statement = log_restore_statement(name, file, position, self.options());
        self.execute(&statement, cancel).await
    }

    /// Applies each backup set of a LOG file by ascending position. Sets
    /// already covered by the database are skipped.
    async fn apply_log_positions(
        &self,
        name: &str,
        file: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let rows = self
            .context
            .executor
            .query(
                None,
                &format!("RESTORE HEADERONLY FROM DISK = N'{}'", quote_literal(&file.display().to_string())),
                self.options().command_timeout,
                cancel,
            )
            .await?;
        let mut positions: Vec<i64> = rows.iter().filter_map(|r| r.get_i64("Position")).collect();
        positions.sort_unstable();

        for position in positions {
            match self.apply_log(name, file, position, cancel).await {
                Err(e) if e.is_sql_number(&[TOO_EARLY]) => {
                    debug!("{} : position {} of {} already applied", name, position, file.display());
                }
                other => other?,
            }
        }
        Ok(())
    }

    /// Data and log logical names read from the backup media.
    async fn logical_names(
        &self,
        file: &Path,
        cancel: &CancellationToken,
    ) -> Result<(String, String), AppError> {
        let rows = self
            .context
            .executor
            .query(
                None,
                &format!("RESTORE FILELISTONLY FROM DISK = N'{}'", quote_literal(&file.display().to_string())),
                self.options().command_timeout,
                cancel,
            )
            .await?;
        let logical = |kind: &str| {
            rows.iter()
                .find(|r| r.get("Type").is_some_and(|t| t.eq_ignore_ascii_case(kind)))
                .and_then(|r| r.get("LogicalName"))
                .map(str::to_string)
                .ok_or_else(|| {
                    AppError::Restore(format!("no {} file in file list of {}", kind, file.display()))
                })
        };
        Ok((logical("D")?, logical("L")?))
    }

    async fn drop_database(
        &self,
        name: &str,
        single_user: bool,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let ident = quote_identifier(name);
        if single_user {
            self.execute(
                &format!("ALTER DATABASE [{}] SET SINGLE_USER WITH ROLLBACK IMMEDIATE", ident),
                cancel,
            )
            .await?;
        }
        self.execute(
            &format!(
                "IF DB_ID(N'{}') IS NOT NULL DROP DATABASE [{}]",
                quote_literal(name),
                ident
            ),
            cancel,
        )
        .await?;
        self.execute(
            &format!(
                "EXEC msdb.dbo.sp_delete_database_backuphistory @database_name = N'{}'",
                quote_literal(name)
            ),
            cancel,
        )
        .await
    }
}

#[async_trait]
impl RestoreMethod for NativeRestore {
    async fn restore_full(
        &self,
        item: &mut RestoreItem,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        self.restore_chain(item, true, false, cancel).await
    }

    async fn restore_full_diff_log(
        &self,
        item: &mut RestoreItem,
        start_from_full: bool,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        self.restore_chain(item, start_from_full, true, cancel).await
    }

    async fn run_recovery(
        &self,
        item: &RestoreItem,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        recover_database(&self.context, item, cancel).await
    }
}

/// `MAXTRANSFERSIZE`, `BUFFERCOUNT` and `NO_CHECKSUM` options.
fn transfer_options(options: &RestoreConfig) -> String {
    let mut suffix = String::new();
    if let Some(size) = options.max_transfer_size {
        suffix.push_str(&format!(", MAXTRANSFERSIZE = {}", size));
    }
    if let Some(count) = options.buffer_count {
        suffix.push_str(&format!(", BUFFERCOUNT = {}", count));
    }
    if options.no_checksum {
        suffix.push_str(", NO_CHECKSUM");
    }
    suffix
}

fn full_restore_statement(
    name: &str,
    file: &Path,
    logical_data: &str,
    logical_log: &str,
    data_path: &str,
    log_path: &str,
    options: &RestoreConfig,
) -> String {
    format!(
        "RESTORE DATABASE [{}] FROM DISK = N'{}' WITH NORECOVERY, REPLACE, MOVE N'{}' TO N'{}', MOVE N'{}' TO N'{}'{}",
        quote_identifier(name),
        quote_literal(&file.display().to_string()),
        quote_literal(logical_data),
        quote_literal(data_path),
        quote_literal(logical_log),
        quote_literal(log_path),
        transfer_options(options)
    )
}

fn diff_restore_statement(name: &str, file: &Path, options: &RestoreConfig) -> String {
    format!(
        "RESTORE DATABASE [{}] FROM DISK = N'{}' WITH NORECOVERY{}",
        quote_identifier(name),
        quote_literal(&file.display().to_string()),
        transfer_options(options)
    )
}

fn log_restore_statement(name: &str, file: &Path, position: i64, options: &RestoreConfig) -> String {
    format!(
        "RESTORE LOG [{}] FROM DISK = N'{}' WITH FILE = {}, NORECOVERY{}",
        quote_identifier(name),
        quote_literal(&file.display().to_string()),
        position,
        transfer_options(options)
    )
}
