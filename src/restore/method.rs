// sqlrestoretool/src/restore/method.rs
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::db_restore::{
    DatabaseInfo, DatabaseState, RestoreHistoryInfo, ServerInfo, SqlExecutor, quote_identifier,
};
use super::item::RestoreItem;
use super::native::NativeRestore;
use super::procedure::ProcedureRestore;
use crate::config::RestoreConfig;
use crate::errors::AppError;

/// Read-only state shared by every restore of a run: the server snapshot
/// taken at start and the restore options.
pub struct RestoreContext {
    pub executor: Arc<dyn SqlExecutor>,
    pub server: ServerInfo,
    pub options: RestoreConfig,
    databases: HashMap<String, DatabaseInfo>,
    history: HashMap<String, RestoreHistoryInfo>,
}

impl RestoreContext {
    pub fn new(
        executor: Arc<dyn SqlExecutor>,
        server: ServerInfo,
        databases: Vec<DatabaseInfo>,
        history: Vec<RestoreHistoryInfo>,
        options: RestoreConfig,
    ) -> Self {
        Self {
            executor,
            server,
            options,
            databases: databases
                .into_iter()
                .map(|d| (d.name.to_lowercase(), d))
                .collect(),
            history: history
                .into_iter()
                .map(|h| (h.db_name.to_lowercase(), h))
                .collect(),
        }
    }

    /// Database as seen on the server at start, case-insensitive.
    pub fn database(&self, name: &str) -> Option<&DatabaseInfo> {
        self.databases.get(&name.to_lowercase())
    }

    pub fn history(&self, name: &str) -> Option<&RestoreHistoryInfo> {
        self.history.get(&name.to_lowercase())
    }

    pub fn databases(&self) -> impl Iterator<Item = &DatabaseInfo> {
        self.databases.values()
    }

    /// A chain can only be continued on a database left in RESTORING.
    pub fn start_from_full(&self, name: &str) -> bool {
        match self.database(name) {
            None => true,
            Some(db) if db.state != DatabaseState::Restoring => {
                debug!(
                    "Can't continue logs : {} in state {}. Restarting from FULL.",
                    name, db.state
                );
                true
            }
            Some(_) => false,
        }
    }
}

/// One way of bringing a database to the newest backup state. Every method
/// records its progress in `item.stage` and its counters in `item.stats`.
#[async_trait]
pub trait RestoreMethod: Send + Sync {
    /// Newest FULL backup only.
    async fn restore_full(
        &self,
        item: &mut RestoreItem,
        cancel: &CancellationToken,
    ) -> Result<(), AppError>;

    /// FULL (when `start_from_full`), then DIFF and the LOG chain.
    async fn restore_full_diff_log(
        &self,
        item: &mut RestoreItem,
        start_from_full: bool,
        cancel: &CancellationToken,
    ) -> Result<(), AppError>;

    /// Brings the database online.
    async fn run_recovery(
        &self,
        item: &RestoreItem,
        cancel: &CancellationToken,
    ) -> Result<(), AppError>;
}

/// Strategy selected once per run from the configuration.
pub fn restore_method(context: Arc<RestoreContext>) -> Arc<dyn RestoreMethod> {
    if context.options.stored_procedure {
        Arc::new(ProcedureRestore::new(context))
    } else {
        Arc::new(NativeRestore::new(context))
    }
}

pub(crate) fn recovery_statement(name: &str) -> String {
    format!("RESTORE DATABASE [{}] WITH RECOVERY", quote_identifier(name))
}

/// `RESTORE ... WITH RECOVERY`, shared by both strategies.
pub(crate) async fn recover_database(
    context: &RestoreContext,
    item: &RestoreItem,
    cancel: &CancellationToken,
) -> Result<(), AppError> {
    debug!("running RECOVERY : {}", item.name);
    context
        .executor
        .execute(
            None,
            &recovery_statement(&item.name),
            context.options.command_timeout,
            cancel,
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restore::db_restore::testing::ScriptedExecutor;

    fn context(databases: Vec<DatabaseInfo>) -> RestoreContext {
        RestoreContext::new(
            Arc::new(ScriptedExecutor::ok()),
            ServerInfo::default(),
            databases,
            Vec::new(),
            RestoreConfig::default(),
        )
    }

    #[test]
    fn test_start_from_full_depends_on_server_state() {
        let ctx = context(vec![
            DatabaseInfo { name: "Restoring".into(), state: DatabaseState::Restoring },
            DatabaseInfo { name: "online".into(), state: DatabaseState::Online },
        ]);
        assert!(ctx.start_from_full("absent"));
        assert!(ctx.start_from_full("ONLINE"));
        assert!(!ctx.start_from_full("restoring"));
    }

    #[test]
    fn test_recovery_statement_escapes_name() {
        assert_eq!(recovery_statement("db1"), "RESTORE DATABASE [db1] WITH RECOVERY");
        assert_eq!(recovery_statement("we]ird"), "RESTORE DATABASE [we]]ird] WITH RECOVERY");
    }
}
