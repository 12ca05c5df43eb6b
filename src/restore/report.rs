// sqlrestoretool/src/restore/report.rs
use chrono::{DateTime, Local, NaiveDateTime};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use super::db_restore::{DatabaseInfo, ServerInfo};
use super::item::{DuplicateExclusion, MissingFullBackup, RestoreItem, RestoreStats, UnitOutcome};
use crate::config::{RestoreConfig, is_name_ignored};

const MISSING_FULL_GRACE_HOURS: i64 = 24;

/// Bitset of the run outcome: `OK` is the empty set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct ReportStatus(u8);

impl ReportStatus {
    pub const OK: Self = Self(0);
    pub const WARNING: Self = Self(1);
    pub const ERROR: Self = Self(2);

    pub fn insert(&mut self, flag: Self) {
        self.0 |= flag.0;
    }

    pub fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(Self::WARNING), self.contains(Self::ERROR)) {
            (false, false) => f.write_str("Ok"),
            (true, false) => f.write_str("Warning"),
            (false, true) => f.write_str("Error"),
            (true, true) => f.write_str("Warning, Error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoredEntry {
    pub name: String,
    pub stats: RestoreStats,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEntry {
    pub name: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpoOutlier {
    pub name: String,
    pub rpo: Duration,
}

/// Aggregate of a finished run, handed to the report sinks.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub server: ServerInfo,
    pub mode: String,
    pub status: ReportStatus,
    pub restored: Vec<RestoredEntry>,
    pub errors: Vec<ErrorEntry>,
    /// Units interrupted by cancellation.
    pub canceled: Vec<String>,
    /// Units never started.
    pub pending: Vec<String>,
    /// Missing FULL folders created within the last 24 hours.
    pub missing_full: Vec<MissingFullBackup>,
    pub missing_full_older: Vec<MissingFullBackup>,
    /// Databases on the server with no backup folder in this run.
    pub without_backup: Vec<DatabaseInfo>,
    pub duplicates: Vec<DuplicateExclusion>,
    pub avg_rpo: Option<Duration>,
    pub max_rpo: Option<Duration>,
    pub rpo_limit: Option<Duration>,
    pub rpo_outliers: Vec<RpoOutlier>,
    pub parallel_ratio: f64,
    pub total_processed: usize,
    pub total_time: Duration,
    /// Sum of the per-unit restore times.
    pub accumulated_time: Duration,
}

impl BatchReport {
    pub fn has_issue(&self) -> bool {
        !self.status.is_ok()
    }

    /// `Restore Backup {host} : restored/total`
    pub fn subject(&self) -> String {
        format!(
            "Restore Backup {} : {}/{}",
            self.server.host_name,
            self.restored.len(),
            self.total_processed
        )
    }
}

/// Everything the run collected, as seen once the engine has drained.
pub struct ReportInput<'a> {
    pub server: &'a ServerInfo,
    pub options: &'a RestoreConfig,
    pub items: &'a [RestoreItem],
    pub missing_full: &'a [MissingFullBackup],
    pub duplicates: &'a [DuplicateExclusion],
    pub server_databases: Vec<&'a DatabaseInfo>,
    /// Local time the run started, stands in for units without a completion time.
    pub started: NaiveDateTime,
    pub now: DateTime<Local>,
    pub total_time: Duration,
    pub accumulated: Duration,
}

pub fn build_report(input: ReportInput<'_>) -> BatchReport {
    let mut status = ReportStatus::OK;
    let mut items: Vec<&RestoreItem> = input.items.iter().collect();
    items.sort_by(|a, b| a.name.cmp(&b.name));

    let mut restored = Vec::new();
    let mut errors = Vec::new();
    let mut canceled = Vec::new();
    let mut pending = Vec::new();
    for item in &items {
        match &item.outcome {
            UnitOutcome::Success => restored.push(RestoredEntry {
                name: item.name.clone(),
                stats: item.stats,
                elapsed: item.elapsed,
            }),
            UnitOutcome::Failed(_) | UnitOutcome::NoFullBackup => errors.push(ErrorEntry {
                name: item.name.clone(),
                message: item.error_message().unwrap_or_default(),
            }),
            UnitOutcome::Canceled => canceled.push(item.name.clone()),
            UnitOutcome::Pending => pending.push(item.name.clone()),
        }
    }
    if !errors.is_empty() {
        status.insert(ReportStatus::ERROR);
    }
    if !canceled.is_empty() || !pending.is_empty() {
        status.insert(ReportStatus::WARNING);
    }

    let mut missing: Vec<MissingFullBackup> = input.missing_full.to_vec();
    missing.sort_by(|a, b| a.name.cmp(&b.name));
    let threshold = input.now - chrono::Duration::hours(MISSING_FULL_GRACE_HOURS);
    let (missing_full, missing_full_older): (Vec<_>, Vec<_>) = missing
        .into_iter()
        .partition(|m| m.created.is_some_and(|created| created > threshold));
    if !missing_full_older.is_empty() {
        status.insert(ReportStatus::WARNING);
    }

    let mut without_backup = Vec::new();
    if input.options.databases.is_empty() {
        let in_run: HashSet<String> = input.items.iter().map(|i| i.name.to_lowercase()).collect();
        without_backup = input
            .server_databases
            .iter()
            .filter(|db| !in_run.contains(&db.name.to_lowercase()))
            .filter(|db| !is_name_ignored(&input.options.ignore_databases, &db.name))
            .map(|db| (*db).clone())
            .collect();
        without_backup.sort_by(|a, b| a.name.cmp(&b.name));
    }
    if !without_backup.is_empty() {
        status.insert(ReportStatus::WARNING);
    }

    let duplicates = input.duplicates.to_vec();
    if !duplicates.is_empty() {
        status.insert(ReportStatus::WARNING);
    }

    let rpos: Vec<(&str, Duration)> = items
        .iter()
        .filter(|i| !i.is_failed())
        .filter_map(|i| {
            let recent = i.rpo_recent_restore?;
            let up = i.rpo_current_restore.unwrap_or(input.started);
            Some((i.name.as_str(), (up - recent).to_std().unwrap_or(Duration::ZERO)))
        })
        .collect();

    let (avg_rpo, max_rpo) = if rpos.is_empty() {
        (None, None)
    } else {
        let total: Duration = rpos.iter().map(|(_, rpo)| *rpo).sum();
        let avg = total / rpos.len() as u32;
        (Some(avg), rpos.iter().map(|(_, rpo)| *rpo).max())
    };
    let rpo_limit = input
        .options
        .rpo_limit_minutes
        .map(|minutes| Duration::from_secs(minutes * 60))
        .or(avg_rpo.map(|avg| avg * 2));

    let mut rpo_outliers: Vec<RpoOutlier> = match rpo_limit {
        Some(limit) => rpos
            .iter()
            .filter(|(_, rpo)| *rpo > limit)
            .map(|(name, rpo)| RpoOutlier {
                name: name.to_string(),
                rpo: *rpo,
            })
            .collect(),
        None => Vec::new(),
    };
    rpo_outliers.sort_by(|a, b| b.rpo.cmp(&a.rpo));
    if !rpo_outliers.is_empty() {
        status.insert(ReportStatus::WARNING);
    }

    BatchReport {
        run_id: Uuid::new_v4(),
        server: input.server.clone(),
        mode: input.options.mode(),
        status,
        restored,
        errors,
        canceled,
        pending,
        missing_full,
        missing_full_older,
        without_backup,
        duplicates,
        avg_rpo,
        max_rpo,
        rpo_limit,
        rpo_outliers,
        parallel_ratio: parallel_ratio(input.accumulated, input.total_time),
        total_processed: input.items.len(),
        total_time: input.total_time,
        accumulated_time: input.accumulated,
    }
}

/// Sum of per-unit times over wall-clock time, two decimals.
pub fn parallel_ratio(accumulated: Duration, total: Duration) -> f64 {
    if total.is_zero() {
        return 0.0;
    }
    (accumulated.as_secs_f64() / total.as_secs_f64() * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use crate::restore::db_restore::DatabaseState;
    use std::path::PathBuf;

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn item(name: &str, recent: Option<&str>, current: Option<&str>) -> RestoreItem {
        let mut item = RestoreItem::new(name.into(), 0, PathBuf::from(name), PathBuf::from(name).join("FULL"));
        item.outcome = UnitOutcome::Success;
        item.rpo_recent_restore = recent.map(dt);
        item.rpo_current_restore = current.map(dt);
        item
    }

    fn input<'a>(
        options: &'a RestoreConfig,
        items: &'a [RestoreItem],
        server: &'a ServerInfo,
    ) -> ReportInput<'a> {
        ReportInput {
            server,
            options,
            items,
            missing_full: &[],
            duplicates: &[],
            server_databases: Vec::new(),
            started: dt("2020-01-02 00:00:00"),
            now: Local::now(),
            total_time: Duration::from_secs(10),
            accumulated: Duration::from_secs(25),
        }
    }

    #[test]
    fn test_all_good_is_ok() {
        let options = RestoreConfig::default();
        let server = ServerInfo::default();
        let items = vec![
            item("b", Some("2020-01-01 23:00:00"), Some("2020-01-02 00:00:00")),
            item("a", Some("2020-01-01 23:00:00"), Some("2020-01-02 00:00:00")),
        ];
        let report = build_report(input(&options, &items, &server));
        assert!(report.status.is_ok());
        assert_eq!(report.restored[0].name, "a");
        assert_eq!(report.avg_rpo, Some(Duration::from_secs(3600)));
        assert_eq!(report.rpo_limit, Some(Duration::from_secs(7200)));
        assert_eq!(report.parallel_ratio, 2.5);
        assert_eq!(report.subject(), "Restore Backup  : 2/2");
    }

    #[test]
    fn test_errors_set_error_flag() {
        let options = RestoreConfig::default();
        let server = ServerInfo::default();
        let mut failed = item("bad", None, None);
        failed.set_error(&AppError::Restore("boom".into()));
        let items = vec![failed, item("good", None, None)];
        let report = build_report(input(&options, &items, &server));
        assert!(report.status.contains(ReportStatus::ERROR));
        assert!(!report.status.contains(ReportStatus::WARNING));
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].message.contains("boom"));
        assert_eq!(report.avg_rpo, None);
        assert_eq!(report.status.to_string(), "Error");
    }

    #[test]
    fn test_rpo_outliers_against_limit() {
        let mut options = RestoreConfig::default();
        options.rpo_limit_minutes = Some(90);
        let server = ServerInfo::default();
        let mut failed = item("failed", Some("2019-01-01 00:00:00"), None);
        failed.set_error(&AppError::Restore("x".into()));
        let items = vec![
            item("fresh", Some("2020-01-01 23:30:00"), Some("2020-01-02 00:00:00")),
            item("stale", Some("2020-01-01 20:00:00"), Some("2020-01-02 00:00:00")),
            // no completion time: measured against the run start
            item("start", Some("2020-01-01 23:00:00"), None),
            failed,
        ];
        let report = build_report(input(&options, &items, &server));
        assert_eq!(report.max_rpo, Some(Duration::from_secs(4 * 3600)));
        assert_eq!(report.rpo_outliers, vec![RpoOutlier { name: "stale".into(), rpo: Duration::from_secs(4 * 3600) }]);
        assert!(report.status.contains(ReportStatus::WARNING));
        assert!(report.status.contains(ReportStatus::ERROR));
    }

    #[test]
    fn test_missing_full_split_by_age() {
        let options = RestoreConfig::default();
        let server = ServerInfo::default();
        let now = Local::now();
        let missing = vec![
            MissingFullBackup { name: "recent".into(), path: PathBuf::from("recent"), created: Some(now - chrono::Duration::hours(2)) },
            MissingFullBackup { name: "old".into(), path: PathBuf::from("old"), created: Some(now - chrono::Duration::hours(30)) },
        ];
        let mut report_input = input(&options, &[], &server);
        report_input.missing_full = &missing;
        report_input.now = now;
        let report = build_report(report_input);
        assert_eq!(report.missing_full[0].name, "recent");
        assert_eq!(report.missing_full_older[0].name, "old");
        assert!(report.status.contains(ReportStatus::WARNING));
    }

    #[test]
    fn test_recent_missing_full_is_not_a_warning() {
        let options = RestoreConfig::default();
        let server = ServerInfo::default();
        let missing = vec![MissingFullBackup {
            name: "recent".into(),
            path: PathBuf::from("recent"),
            created: Some(Local::now()),
        }];
        let mut report_input = input(&options, &[], &server);
        report_input.missing_full = &missing;
        assert!(build_report(report_input).status.is_ok());
    }

    #[test]
    fn test_databases_without_backup() {
        let mut options = RestoreConfig::default();
        options.ignore_databases = vec!["scratch".into()];
        let server = ServerInfo::default();
        let items = vec![item("Sales", None, None)];
        let dbs = vec![
            DatabaseInfo { name: "sales".into(), state: DatabaseState::Online },
            DatabaseInfo { name: "orphan".into(), state: DatabaseState::Restoring },
            DatabaseInfo { name: "scratch_01".into(), state: DatabaseState::Online },
        ];
        let mut report_input = input(&options, &items, &server);
        report_input.server_databases = dbs.iter().collect();
        let report = build_report(report_input);
        assert_eq!(report.without_backup.len(), 1);
        assert_eq!(report.without_backup[0].name, "orphan");
        assert!(report.status.contains(ReportStatus::WARNING));

        options.databases = vec!["Sales".into()];
        let mut report_input = input(&options, &items, &server);
        report_input.server_databases = dbs.iter().collect();
        assert!(build_report(report_input).without_backup.is_empty());
    }

    #[test]
    fn test_canceled_and_pending_are_warnings() {
        let options = RestoreConfig::default();
        let server = ServerInfo::default();
        let mut canceled = item("c", None, None);
        canceled.outcome = UnitOutcome::Canceled;
        let mut pending = item("p", None, None);
        pending.outcome = UnitOutcome::Pending;
        let items = vec![canceled, pending, item("ok", None, None)];
        let report = build_report(input(&options, &items, &server));
        assert_eq!(report.canceled, vec!["c"]);
        assert_eq!(report.pending, vec!["p"]);
        assert_eq!(report.restored.len(), 1);
        assert_eq!(report.status, ReportStatus::WARNING);
    }

    #[test]
    fn test_parallel_ratio_rounding() {
        assert_eq!(parallel_ratio(Duration::from_millis(1000), Duration::from_millis(3000)), 0.33);
        assert_eq!(parallel_ratio(Duration::from_secs(5), Duration::ZERO), 0.0);
    }
}
