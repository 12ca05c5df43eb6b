//! Delivery of the end-of-run report.
// sqlrestoretool/src/notification/mod.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::config::ReportConfig;
use crate::restore::BatchReport;
use crate::utils::humanize_duration;

/// Destination of the finished [`BatchReport`].
#[async_trait]
pub trait ReportSink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, report: &BatchReport) -> Result<()>;
}

/// Writes the run summary to the application log.
pub struct LogReportSink;

#[async_trait]
impl ReportSink for LogReportSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, report: &BatchReport) -> Result<()> {
        info!(
            "Parallel ratio {} ({} accumulated)",
            report.parallel_ratio,
            humanize_duration(report.accumulated_time, 2)
        );
        info!("Finished job in {}", humanize_duration(report.total_time, 2));

        for db in &report.without_backup {
            warn!(
                "Warning backup not found for [{}]. This database exists on server, but no backup found. Need to be dropped ?",
                db.name
            );
        }
        for missing in report.missing_full.iter().chain(&report.missing_full_older) {
            error!("Missing backup FULL for {}. [{}]", missing.name, missing.path.display());
        }
        for dup in &report.duplicates {
            warn!("Duplicate backup folders ({}) for {}", dup.count, dup.name);
        }
        if !report.canceled.is_empty() {
            warn!("Canceled : {}", report.canceled.join(", "));
        }
        if !report.pending.is_empty() {
            warn!("Not started : {}", report.pending.join(", "));
        }
        if let (Some(avg), Some(max)) = (report.avg_rpo, report.max_rpo) {
            info!("RPO : AVG={}, MAX={}", humanize_duration(avg, 2), humanize_duration(max, 2));
            if !report.rpo_outliers.is_empty() {
                let outliers = report
                    .rpo_outliers
                    .iter()
                    .map(|o| format!("[{}]:{}", o.name, humanize_duration(o.rpo, 2)))
                    .collect::<Vec<_>>()
                    .join(" , ");
                warn!("Outliers : {}", outliers);
            }
        }
        info!(
            "{} - status {} ({} errors)",
            report.subject(),
            report.status,
            report.errors.len()
        );
        Ok(())
    }
}

/// Plain-text report, the body of the notification mail.
pub struct TextReportSink {
    path: PathBuf,
}

impl TextReportSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl ReportSink for TextReportSink {
    fn name(&self) -> &str {
        "text"
    }

    async fn send(&self, report: &BatchReport) -> Result<()> {
        let body = format!("{}\n\n{}", report.subject(), render_text(report));
        tokio::fs::write(&self.path, body)
            .await
            .with_context(|| format!("Failed to write text report to {}", self.path.display()))
    }
}

/// Full report as JSON, for dashboards and other tooling.
pub struct JsonReportSink {
    path: PathBuf,
}

impl JsonReportSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl ReportSink for JsonReportSink {
    fn name(&self) -> &str {
        "json"
    }

    async fn send(&self, report: &BatchReport) -> Result<()> {
        let json = serde_json::to_string_pretty(report).context("Failed to serialize report")?;
        tokio::fs::write(&self.path, json)
            .await
            .with_context(|| format!("Failed to write JSON report to {}", self.path.display()))
    }
}

pub fn render_text(report: &BatchReport) -> String {
    let mut text = String::new();
    let _ = writeln!(text, "Restore finished in {}", humanize_duration(report.total_time, 2));
    let _ = writeln!(text, "Mode : {}", report.mode);
    text.push('\n');

    if !report.errors.is_empty() {
        let _ = writeln!(text, "Errors : {}", report.errors.len());
        for e in &report.errors {
            let _ = writeln!(text, "{} : {}", e.name, e.message);
        }
        text.push('\n');
    }

    if !report.without_backup.is_empty() {
        let _ = writeln!(text, "Warnings : {}", report.without_backup.len());
        for db in &report.without_backup {
            let _ = writeln!(text, "Db {} in state {}, no .bak found", db.name, db.state);
        }
        text.push('\n');
    }

    let missing = report.missing_full.len() + report.missing_full_older.len();
    if missing != 0 {
        let _ = writeln!(text, "Missing .bak : {}", missing);
        for m in report.missing_full.iter().chain(&report.missing_full_older) {
            let _ = writeln!(text, "Missing .bak in folder {}", m.path.display());
        }
        text.push('\n');
    }

    if !report.restored.is_empty() {
        let _ = writeln!(text, "OK : {}", report.restored.len());
        for r in &report.restored {
            let _ = writeln!(text, "{}", r.name);
        }
        text.push('\n');
    }
    text
}

/// Sinks configured for this run. The log sink is always present.
pub fn configured_sinks(config: &ReportConfig) -> Vec<Box<dyn ReportSink>> {
    let mut sinks: Vec<Box<dyn ReportSink>> = vec![Box::new(LogReportSink)];
    if let Some(path) = &config.text_path {
        sinks.push(Box::new(TextReportSink::new(path.clone())));
    }
    if let Some(path) = &config.json_path {
        sinks.push(Box::new(JsonReportSink::new(path.clone())));
    }
    sinks
}

/// Sends the report to every sink. Failures are logged and never change the
/// outcome of the run. With `only_on_issue`, a clean run only reaches the log.
pub async fn notify_all(sinks: &[Box<dyn ReportSink>], report: &BatchReport, only_on_issue: bool) {
    for sink in sinks {
        if only_on_issue && !report.has_issue() && sink.name() != "log" {
            continue;
        }
        if let Err(e) = sink.send(report).await {
            error!("Report sink {} failed: {:?}", sink.name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restore::{
        DatabaseInfo, DatabaseState, ErrorEntry, MissingFullBackup, ReportStatus, RestoredEntry,
        ServerInfo,
    };
    use std::time::Duration;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn report(status: ReportStatus) -> BatchReport {
        BatchReport {
            run_id: Uuid::new_v4(),
            server: ServerInfo {
                host_name: "SQL01".into(),
                ..Default::default()
            },
            mode: "Full + Logs no recovery".into(),
            status,
            restored: vec![RestoredEntry {
                name: "sales".into(),
                stats: Default::default(),
                elapsed: Duration::from_secs(3),
            }],
            errors: vec![ErrorEntry {
                name: "hr".into(),
                message: "[FULL] error 3201 : cannot open".into(),
            }],
            canceled: vec![],
            pending: vec![],
            missing_full: vec![MissingFullBackup {
                name: "stock".into(),
                path: PathBuf::from("/b/stock"),
                created: None,
            }],
            missing_full_older: vec![],
            without_backup: vec![DatabaseInfo {
                name: "orphan".into(),
                state: DatabaseState::Online,
            }],
            duplicates: vec![],
            avg_rpo: Some(Duration::from_secs(3600)),
            max_rpo: Some(Duration::from_secs(7200)),
            rpo_limit: None,
            rpo_outliers: vec![],
            parallel_ratio: 1.5,
            total_processed: 2,
            total_time: Duration::from_secs(3700),
            accumulated_time: Duration::from_secs(5550),
        }
    }

    #[test]
    fn test_render_text_sections() {
        let text = render_text(&report(ReportStatus::ERROR));
        assert!(text.starts_with("Restore finished in 1h 1m\n"));
        assert!(text.contains("Errors : 1\nhr : [FULL] error 3201 : cannot open\n"));
        assert!(text.contains("Warnings : 1\nDb orphan in state ONLINE, no .bak found\n"));
        assert!(text.contains("Missing .bak : 1\nMissing .bak in folder /b/stock\n"));
        assert!(text.contains("OK : 1\nsales\n"));
    }

    #[tokio::test]
    async fn test_file_sinks_respect_only_on_issue() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let config = ReportConfig {
            text_path: Some(dir.path().join("report.txt")),
            json_path: Some(dir.path().join("report.json")),
            only_on_issue: true,
        };
        let sinks = configured_sinks(&config);
        assert_eq!(sinks.len(), 3);

        notify_all(&sinks, &report(ReportStatus::OK), config.only_on_issue).await;
        assert!(!dir.path().join("report.txt").exists());

        notify_all(&sinks, &report(ReportStatus::ERROR), config.only_on_issue).await;
        let text = std::fs::read_to_string(dir.path().join("report.txt"))?;
        assert!(text.starts_with("Restore Backup SQL01 : 1/2"));
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("report.json"))?)?;
        assert_eq!(json["status"], 2);
        assert_eq!(json["errors"][0]["name"], "hr");
        Ok(())
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_propagate() {
        let sinks: Vec<Box<dyn ReportSink>> = vec![Box::new(TextReportSink::new(PathBuf::from(
            "/nonexistent-dir/report.txt",
        )))];
        notify_all(&sinks, &report(ReportStatus::ERROR), false).await;
    }
}
