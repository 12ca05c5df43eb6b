use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Error raised by the SQL execution collaborator.
///
/// Retry decisions in the restore state machine are driven entirely by
/// [`SqlError::number`], so server errors always carry the `Msg N` code.
#[derive(Error, Debug, Clone)]
pub enum SqlError {
    #[error("Msg {number}, Level {level}: {message}")]
    Server {
        number: i32,
        level: i32,
        message: String,
    },

    #[error("SQL command timed out after {0:?}")]
    Timeout(Duration),

    #[error("SQL command cancelled")]
    Cancelled,

    #[error("SQL client failure: {0}")]
    Client(String),
}

impl SqlError {
    pub fn number(&self) -> Option<i32> {
        match self {
            SqlError::Server { number, .. } => Some(*number),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Error while analyzing source folder: {}", .0.display())]
    SourceFolder(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQL Server error: {0}")]
    Sql(#[from] SqlError),

    #[error("{0} : No backup full found")]
    NoFullBackup(String),

    #[error("Restore operation failed: {0}")]
    Restore(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AppError {
    /// Server error number, when the failure came from the server.
    pub fn sql_number(&self) -> Option<i32> {
        match self {
            AppError::Sql(e) => e.number(),
            _ => None,
        }
    }

    pub fn is_sql_number(&self, codes: &[i32]) -> bool {
        self.sql_number().is_some_and(|n| codes.contains(&n))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled(_) | AppError::Sql(SqlError::Cancelled))
    }
}

/// True when any error in the chain is a cancellation.
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<AppError>()
            .is_some_and(AppError::is_cancelled)
            || matches!(cause.downcast_ref::<SqlError>(), Some(SqlError::Cancelled))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_number_matching() {
        let err = AppError::from(SqlError::Server {
            number: 3201,
            level: 16,
            message: "Cannot open backup device".to_string(),
        });
        assert_eq!(err.sql_number(), Some(3201));
        assert!(err.is_sql_number(&[3634, 3201]));
        assert!(!err.is_sql_number(&[4326]));
        assert!(AppError::Restore("x".into()).sql_number().is_none());
    }

    #[test]
    fn test_cancellation_detected_through_context() {
        let err = anyhow::Error::from(AppError::Cancelled("shutdown".into()))
            .context("restoring db1");
        assert!(is_cancellation(&err));

        let err = anyhow::Error::from(SqlError::Cancelled).context("log chain");
        assert!(is_cancellation(&err));

        let err = anyhow::anyhow!("boom");
        assert!(!is_cancellation(&err));
    }
}
