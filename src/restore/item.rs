use chrono::{DateTime, Local, NaiveDateTime};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::AppError;

/// Step of the per-database flow a unit was in when it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum RestoreStage {
    #[default]
    Full,
    Diff,
    Log,
    Recovery,
    CheckDb,
    PostScript,
    Relocation,
    Procedure,
}

impl fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Full => "FULL",
            Self::Diff => "DIFF",
            Self::Log => "LOG",
            Self::Recovery => "RECOVERY",
            Self::CheckDb => "CHECKDB",
            Self::PostScript => "POST SCRIPT",
            Self::Relocation => "RELOCATION",
            Self::Procedure => "PROCEDURE",
        };
        f.write_str(name)
    }
}

/// Everything the report needs to render a failed unit without going back
/// to the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitFailure {
    pub stage: RestoreStage,
    pub message: String,
    pub code: Option<i32>,
}

impl UnitFailure {
    pub fn from_error(stage: RestoreStage, error: &AppError) -> Self {
        Self {
            stage,
            message: error.to_string(),
            code: error.sql_number(),
        }
    }
}

impl fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "[{}] error {} : {}", self.stage, code, self.message),
            None => write!(f, "[{}] {}", self.stage, self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub enum UnitOutcome {
    #[default]
    Pending,
    Success,
    Failed(UnitFailure),
    NoFullBackup,
    Canceled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreStats {
    pub full: u32,
    pub diff: u32,
    pub log: u32,
    pub dropped: u32,
}

/// One database's backup set and the bookkeeping of its restore.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreItem {
    pub name: String,
    pub root_index: usize,
    pub base_dir: PathBuf,
    pub full: PathBuf,
    pub diff: Option<PathBuf>,
    pub log: Option<PathBuf>,
    /// Sum of the `.bak` sizes in the FULL folder.
    pub full_size: u64,
    pub stats: RestoreStats,
    /// Date of the most recent backup applied to the database.
    pub rpo_recent_restore: Option<NaiveDateTime>,
    /// Wall-clock time the restore of this unit finished.
    pub rpo_current_restore: Option<NaiveDateTime>,
    pub elapsed: Duration,
    pub stage: RestoreStage,
    pub outcome: UnitOutcome,
}

impl RestoreItem {
    pub fn new(name: String, root_index: usize, base_dir: PathBuf, full: PathBuf) -> Self {
        Self {
            name,
            root_index,
            base_dir,
            full,
            diff: None,
            log: None,
            full_size: 0,
            stats: RestoreStats::default(),
            rpo_recent_restore: None,
            rpo_current_restore: None,
            elapsed: Duration::ZERO,
            stage: RestoreStage::Full,
            outcome: UnitOutcome::Pending,
        }
    }

    /// Failed outright or had no FULL backup to start from.
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, UnitOutcome::Failed(_) | UnitOutcome::NoFullBackup)
    }

    pub fn failure(&self) -> Option<&UnitFailure> {
        match &self.outcome {
            UnitOutcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    /// Report line for a failed unit.
    pub fn error_message(&self) -> Option<String> {
        if let Some(failure) = self.failure() {
            return Some(failure.to_string());
        }
        matches!(self.outcome, UnitOutcome::NoFullBackup)
            .then(|| format!("{} : No backup full found", self.name))
    }

    /// Records an error against the stage the unit is currently in.
    pub fn set_error(&mut self, error: &AppError) {
        self.outcome = match error {
            AppError::NoFullBackup(_) => UnitOutcome::NoFullBackup,
            _ => UnitOutcome::Failed(UnitFailure::from_error(self.stage, error)),
        };
    }

    pub fn set_success(&mut self) {
        self.outcome = UnitOutcome::Success;
        self.rpo_current_restore = Some(Local::now().naive_local());
    }

    /// Counter summary for progress logs, e.g. `(1 full, 3 log)`.
    /// Empty when nothing was applied.
    pub fn stats_summary(&self) -> String {
        let s = &self.stats;
        if s.full + s.diff + s.log == 0 {
            return String::new();
        }
        let mut parts = Vec::new();
        if s.full != 0 {
            parts.push(format!("{} full", s.full));
        }
        if s.diff != 0 {
            parts.push(format!("{} diff", s.diff));
        }
        if s.log != 0 {
            parts.push(format!("{} log", s.log));
        }
        if s.dropped != 0 {
            parts.push(format!("{} drop database", s.dropped));
        }
        format!("({})", parts.join(", "))
    }
}

/// A unit directory without a usable FULL folder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissingFullBackup {
    pub name: String,
    pub path: PathBuf,
    pub created: Option<DateTime<Local>>,
}

/// Copies of one database found under several roots; only the newest survives.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateExclusion {
    pub name: String,
    pub count: usize,
    pub excluded: Vec<PathBuf>,
}
