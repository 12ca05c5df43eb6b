// sqlrestoretool/src/restore/verification.rs
use regex::Regex;
use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::db_restore::{SqlExecutor, quote_identifier};
use crate::errors::AppError;

/// Per-batch timeout of post-restore scripts.
pub const POST_SCRIPT_TIMEOUT: Duration = Duration::from_secs(180);

static BATCH_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bGO\b").expect("valid batch separator regex"));

/// Runs `DBCC CHECKDB` on a recovered database. Any reported row is a
/// consistency problem.
pub async fn check_database(
    executor: &dyn SqlExecutor,
    database: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), AppError> {
    debug!("running CHECKDB : {}", database);
    let rows = executor
        .query(
            None,
            &format!(
                "DBCC CHECKDB([{}]) WITH TABLERESULTS, NO_INFOMSGS",
                quote_identifier(database)
            ),
            timeout,
            cancel,
        )
        .await?;

    match rows.first() {
        None => Ok(()),
        Some(first) => Err(AppError::Verification(format!(
            "{} : CHECKDB reported {} problem(s), first : {}",
            database,
            rows.len(),
            first.get("MessageText").unwrap_or("no message")
        ))),
    }
}

/// Splits a script into batches on `GO` separators, dropping blank batches.
pub fn split_batches(script: &str) -> Vec<String> {
    BATCH_SEPARATOR
        .split(script)
        .filter(|batch| !batch.trim().is_empty())
        .map(|batch| batch.trim().to_string())
        .collect()
}

/// SQL scripts applied to every recovered database, read once per run.
#[derive(Debug, Clone, Default)]
pub struct PostScripts {
    batches: Vec<String>,
    /// Only databases whose name starts with this prefix get the scripts.
    filter: Option<String>,
}

impl PostScripts {
    pub fn load(paths: &[PathBuf], filter: Option<String>) -> Result<Self, AppError> {
        let mut batches = Vec::new();
        for path in paths {
            let script = fs::read_to_string(path).map_err(|e| {
                AppError::Config(format!("cannot read post script {} : {}", path.display(), e))
            })?;
            batches.extend(split_batches(&script));
        }
        Ok(Self { batches, filter })
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn applies_to(&self, database: &str) -> bool {
        match &self.filter {
            Some(prefix) => database
                .to_lowercase()
                .starts_with(&prefix.to_lowercase()),
            None => true,
        }
    }

    /// Runs every batch in order against `database`. Stops at the first error.
    pub async fn run(
        &self,
        executor: &dyn SqlExecutor,
        database: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        if self.is_empty() {
            return Ok(());
        }
        if !self.applies_to(database) {
            debug!(
                "Ignoring database {} because of post_script_filter : {}",
                database,
                self.filter.as_deref().unwrap_or_default()
            );
            return Ok(());
        }

        debug!("Applying {} sql scripts on {}", self.len(), database);
        for batch in &self.batches {
            executor
                .execute(Some(database), batch, POST_SCRIPT_TIMEOUT, cancel)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restore::db_restore::SqlRow;
    use crate::restore::db_restore::testing::ScriptedExecutor;
    use tempfile::tempdir;

    #[test]
    fn test_split_batches() {
        let script = "UPDATE t SET a = 1\nGO\n\nGO\nEXEC dbo.cleanup\r\nGO";
        assert_eq!(split_batches(script), vec!["UPDATE t SET a = 1", "EXEC dbo.cleanup"]);
        assert_eq!(split_batches("SELECT 'GOOD'"), vec!["SELECT 'GOOD'"]);
        assert!(split_batches("GO\n  \nGO").is_empty());
    }

    #[tokio::test]
    async fn test_post_scripts_run_in_database() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let first = dir.path().join("01.sql");
        let second = dir.path().join("02.sql");
        fs::write(&first, "ALTER USER app WITH LOGIN = app\nGO\nEXEC sp_updatestats")?;
        fs::write(&second, "DELETE FROM audit")?;

        let scripts = PostScripts::load(&[first, second], Some("Prod".into()))?;
        assert_eq!(scripts.len(), 3);

        let executor = ScriptedExecutor::ok();
        let cancel = CancellationToken::new();
        scripts.run(&executor, "prod_sales", &cancel).await?;
        scripts.run(&executor, "test_sales", &cancel).await?;

        let calls = executor.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|(db, _)| db.as_deref() == Some("prod_sales")));
        assert_eq!(calls[2].1, "DELETE FROM audit");
        Ok(())
    }

    #[test]
    fn test_missing_script_is_config_error() {
        let err = PostScripts::load(&[PathBuf::from("/nonexistent/post.sql")], None).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[tokio::test]
    async fn test_check_database_rows_fail_verification() -> anyhow::Result<()> {
        let clean = ScriptedExecutor::ok();
        check_database(&clean, "db1", Duration::from_secs(1), &CancellationToken::new()).await?;
        assert!(clean.statements()[0].starts_with("DBCC CHECKDB([db1])"));

        let corrupt = ScriptedExecutor::new(|_| {
            Ok(vec![SqlRow::from_pairs(&[("Error", "8928"), ("MessageText", "Object ID 5: page could not be processed")])])
        });
        let err = check_database(&corrupt, "db1", Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Verification(_)));
        assert!(err.to_string().contains("page could not be processed"));
        Ok(())
    }
}
