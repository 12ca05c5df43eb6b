// sqlrestoretool/src/restore/procedure.rs
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::backup_file::{FULL_EXTENSION, LOG_EXTENSION, newest_file};
use super::db_restore::quote_literal;
use super::item::{RestoreItem, RestoreStage};
use super::method::{RestoreContext, RestoreMethod, recover_database};
use crate::errors::AppError;

/// Errors after which the procedure is run again from FULL. 3013 (generic
/// "terminating abnormally") always trails the real error and is not listed.
const RETRY_ERRORS: &[i32] = &[4319, 4305, 3119];

/// Delegates FULL/DIFF/LOG sequencing to `sp_DatabaseRestore` installed on
/// the target server.
pub struct ProcedureRestore {
    context: Arc<RestoreContext>,
}

impl ProcedureRestore {
    pub fn new(context: Arc<RestoreContext>) -> Self {
        Self { context }
    }

    async fn call(
        &self,
        statement: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        self.context
            .executor
            .execute(None, statement, self.context.options.command_timeout, cancel)
            .await?;
        Ok(())
    }

    fn log_failure(item: &RestoreItem, error: &AppError, with_chain: bool) {
        let mut message = format!(
            "Error restoring backup {} : {}\nFULL : {}",
            item.name,
            error,
            item.full.display()
        );
        if with_chain {
            message.push_str(&format!("\nDIFF : {}\nLOG : {}", display(item.diff.as_deref()), display(item.log.as_deref())));
        }
        error!("{}", message);
    }
}

fn display(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string()).unwrap_or_default()
}

#[async_trait]
impl RestoreMethod for ProcedureRestore {
    async fn restore_full(
        &self,
        item: &mut RestoreItem,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        item.stage = RestoreStage::Procedure;
        let statement = ProcedureCall::full_only(item).statement();
        if let Err(e) = self.call(&statement, cancel).await {
            Self::log_failure(item, &e, false);
            return Err(e);
        }
        item.stats.full += 1;
        item.rpo_recent_restore = newest_backup_date(item, false);
        Ok(())
    }

    async fn restore_full_diff_log(
        &self,
        item: &mut RestoreItem,
        start_from_full: bool,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        item.stage = RestoreStage::Procedure;
        let options = &self.context.options;
        let mut call = ProcedureCall::chain(
            item,
            options.continue_logs && !start_from_full,
            options.ignore_already_present_in_msdb,
        );

        let first = self.call(&call.statement(), cancel).await;
        match first {
            Ok(()) => {}
            Err(e) if e.is_sql_number(RETRY_ERRORS) && call.continue_logs => {
                info!("[{}] : retry in full, error {}", item.name, e.sql_number().unwrap_or_default());
                call.continue_logs = false;
                if let Err(e) = self.call(&call.statement(), cancel).await {
                    Self::log_failure(item, &e, true);
                    return Err(e);
                }
            }
            Err(e) if e.is_sql_number(RETRY_ERRORS) => {
                info!("[{}] : retry, error {}", item.name, e.sql_number().unwrap_or_default());
                if let Err(e) = self.call(&call.statement(), cancel).await {
                    Self::log_failure(item, &e, true);
                    return Err(e);
                }
            }
            Err(e) => {
                Self::log_failure(item, &e, true);
                return Err(e);
            }
        }

        if !call.continue_logs {
            item.stats.full += 1;
        }
        item.rpo_recent_restore = newest_backup_date(item, !options.full_only);
        Ok(())
    }

    async fn run_recovery(
        &self,
        item: &RestoreItem,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        recover_database(&self.context, item, cancel).await
    }
}

/// Parameters of one `sp_DatabaseRestore` call.
struct ProcedureCall {
    database: String,
    full: String,
    diff: Option<String>,
    log: Option<String>,
    continue_logs: bool,
    ignore_already_present_in_msdb: bool,
}

impl ProcedureCall {
    fn full_only(item: &RestoreItem) -> Self {
        Self {
            database: item.name.clone(),
            full: item.full.display().to_string(),
            diff: None,
            log: None,
            continue_logs: false,
            ignore_already_present_in_msdb: false,
        }
    }

    fn chain(item: &RestoreItem, continue_logs: bool, ignore_already_present_in_msdb: bool) -> Self {
        Self {
            diff: item.diff.as_ref().map(|p| p.display().to_string()),
            log: item.log.as_ref().map(|p| p.display().to_string()),
            continue_logs,
            ignore_already_present_in_msdb,
            ..Self::full_only(item)
        }
    }

    fn statement(&self) -> String {
        let text = |value: &str| format!("N'{}'", quote_literal(value));
        let optional = |value: &Option<String>| value.as_deref().map(text).unwrap_or_else(|| "NULL".to_string());

        let mut statement = format!(
            "EXEC [dbo].[sp_DatabaseRestore] @Database = {}, @BackupPathFull = {}",
            text(&self.database),
            text(&self.full)
        );
        if self.diff.is_some() || self.log.is_some() {
            statement.push_str(&format!(
                ", @BackupPathDiff = {}, @BackupPathLog = {}",
                optional(&self.diff),
                optional(&self.log)
            ));
        }
        statement.push_str(&format!(
            ", @ContinueLogs = {}, @RunRecovery = 0",
            u8::from(self.continue_logs)
        ));
        if self.ignore_already_present_in_msdb {
            statement.push_str(", @IgnoreAlreadyPresentInMsdb = 1");
        }
        statement
    }
}

/// Newest backup the procedure could have applied.
fn newest_backup_date(item: &RestoreItem, with_chain: bool) -> Option<NaiveDateTime> {
    let newest = |dir: Option<&Path>, extension: &str| {
        dir.and_then(|d| newest_file(d, extension).ok().flatten())
            .map(|(_, date)| date)
    };
    let mut dates = vec![newest(Some(&item.full), FULL_EXTENSION)];
    if with_chain {
        dates.push(newest(item.diff.as_deref(), FULL_EXTENSION));
        dates.push(newest(item.log.as_deref(), LOG_EXTENSION));
    }
    dates.into_iter().flatten().max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RestoreConfig;
    use crate::restore::db_restore::ServerInfo;
    use crate::restore::db_restore::testing::{ScriptedExecutor, server_error};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn method(executor: Arc<ScriptedExecutor>, options: RestoreConfig) -> ProcedureRestore {
        ProcedureRestore::new(Arc::new(RestoreContext::new(
            executor,
            ServerInfo::default(),
            Vec::new(),
            Vec::new(),
            options,
        )))
    }

    fn item(base: &Path) -> RestoreItem {
        for folder in ["FULL", "LOG"] {
            fs::create_dir_all(base.join(folder)).unwrap();
        }
        fs::write(base.join("FULL").join("db1_FULL_20200101_000000.bak"), b"x").unwrap();
        fs::write(base.join("LOG").join("db1_LOG_20200101_040000.trn"), b"x").unwrap();
        let mut item = RestoreItem::new("db1".into(), 0, base.to_path_buf(), base.join("FULL"));
        item.log = Some(base.join("LOG"));
        item
    }

    #[tokio::test]
    async fn test_chain_call_parameters() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut item = item(dir.path());
        let executor = Arc::new(ScriptedExecutor::ok());
        let options = RestoreConfig {
            continue_logs: true,
            ignore_already_present_in_msdb: true,
            ..Default::default()
        };
        method(executor.clone(), options)
            .restore_full_diff_log(&mut item, false, &CancellationToken::new())
            .await?;

        let statements = executor.statements();
        assert_eq!(statements.len(), 1);
        let call = &statements[0];
        assert!(call.starts_with("EXEC [dbo].[sp_DatabaseRestore] @Database = N'db1'"));
        assert!(call.contains("@BackupPathDiff = NULL"));
        assert!(call.contains("@ContinueLogs = 1, @RunRecovery = 0, @IgnoreAlreadyPresentInMsdb = 1"));
        assert_eq!(item.stats.full, 0);
        assert_eq!(
            item.rpo_recent_restore.map(|d| d.to_string()),
            Some("2020-01-01 04:00:00".to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_without_continue_logs() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut item = item(dir.path());
        let calls = AtomicUsize::new(0);
        let executor = Arc::new(ScriptedExecutor::new(move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(server_error(4305))
            } else {
                Ok(Vec::new())
            }
        }));
        let options = RestoreConfig {
            continue_logs: true,
            ..Default::default()
        };
        method(executor.clone(), options)
            .restore_full_diff_log(&mut item, false, &CancellationToken::new())
            .await?;

        let statements = executor.statements();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("@ContinueLogs = 1"));
        assert!(statements[1].contains("@ContinueLogs = 0"));
        assert_eq!(item.stats.full, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_other_errors_are_terminal() {
        let dir = tempdir().unwrap();
        let mut item = item(dir.path());
        let executor = Arc::new(ScriptedExecutor::new(|_| Err(server_error(3013))));
        let err = method(executor.clone(), RestoreConfig::default())
            .restore_full_diff_log(&mut item, true, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.sql_number(), Some(3013));
        assert_eq!(executor.statements().len(), 1);
        assert_eq!(item.stage, RestoreStage::Procedure);
    }

    #[tokio::test]
    async fn test_full_only_call() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut item = item(dir.path());
        let executor = Arc::new(ScriptedExecutor::ok());
        method(executor.clone(), RestoreConfig::default())
            .restore_full(&mut item, &CancellationToken::new())
            .await?;

        let call = &executor.statements()[0];
        assert!(!call.contains("@BackupPathLog"));
        assert!(call.ends_with("@ContinueLogs = 0, @RunRecovery = 0"));
        assert_eq!(item.stats.full, 1);
        assert_eq!(
            item.rpo_recent_restore.map(|d| d.to_string()),
            Some("2020-01-01 00:00:00".to_string())
        );
        Ok(())
    }
}
