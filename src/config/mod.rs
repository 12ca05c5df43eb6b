// sqlrestoretool/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::AppError;

pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 5400;
pub const DEFAULT_BUSY_RETRY_DELAY_SECS: u64 = 10;
pub const MAX_TRANSFER_SIZE_LIMIT: u32 = 4_194_304;
const DEFAULT_LOGS_PATH: &str = "logs";

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JsonRestoreOptions {
    pub backup_folders: Vec<PathBuf>,
    pub unchecked_folders: Vec<PathBuf>,
    pub checked_folder: Option<PathBuf>,
    pub legacy: bool,
    pub reverse_order: bool,
    pub full_only: bool,
    pub continue_logs: bool,
    pub run_recovery: bool,
    pub check_db: bool,
    pub databases: Option<serde_json::Value>,
    pub ignore_databases: Option<serde_json::Value>,
    pub post_scripts: Vec<PathBuf>,
    pub post_script_filter: Option<String>,
    pub rpo_limit_minutes: Option<u64>,
    pub max_transfer_size: Option<u32>,
    pub buffer_count: Option<u32>,
    pub no_checksum: bool,
    pub stored_procedure: bool,
    pub ignore_already_present_in_msdb: bool,
    pub busy_retry_delay_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JsonReportOptions {
    pub text_path: Option<PathBuf>,
    pub json_path: Option<PathBuf>,
    pub only_on_issue: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub target_database_url: Option<String>,
    pub trust_server_certificate: Option<bool>,
    pub command_timeout_secs: Option<u64>,
    pub threads: Option<usize>,
    pub logs_path: Option<PathBuf>,
    pub restore: Option<JsonRestoreOptions>,
    pub report: Option<JsonReportOptions>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct RestoreConfig {
    pub backup_folders: Vec<PathBuf>,
    pub unchecked_folders: Vec<PathBuf>,
    pub checked_folder: Option<PathBuf>,
    pub legacy: bool,
    pub reverse_order: bool,
    pub full_only: bool,
    pub continue_logs: bool,
    pub run_recovery: bool,
    pub check_db: bool,
    pub databases: Vec<String>,
    pub ignore_databases: Vec<String>,
    pub post_scripts: Vec<PathBuf>,
    pub post_script_filter: Option<String>,
    pub rpo_limit_minutes: Option<u64>,
    pub max_transfer_size: Option<u32>,
    pub buffer_count: Option<u32>,
    pub no_checksum: bool,
    pub stored_procedure: bool,
    pub ignore_already_present_in_msdb: bool,
    pub busy_retry_delay: Duration,
    pub command_timeout: Duration,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            backup_folders: Vec::new(),
            unchecked_folders: Vec::new(),
            checked_folder: None,
            legacy: false,
            reverse_order: false,
            full_only: false,
            continue_logs: false,
            run_recovery: false,
            check_db: false,
            databases: Vec::new(),
            ignore_databases: Vec::new(),
            post_scripts: Vec::new(),
            post_script_filter: None,
            rpo_limit_minutes: None,
            max_transfer_size: None,
            buffer_count: None,
            no_checksum: false,
            stored_procedure: false,
            ignore_already_present_in_msdb: false,
            busy_retry_delay: Duration::from_secs(DEFAULT_BUSY_RETRY_DELAY_SECS),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
        }
    }
}

impl RestoreConfig {
    /// Unchecked mode consumes `unchecked_folders` and moves restored units
    /// into `checked_folder`.
    pub fn is_unchecked_mode(&self) -> bool {
        !self.unchecked_folders.is_empty() && self.checked_folder.is_some()
    }

    /// Roots scanned by discovery.
    pub fn source_folders(&self) -> &[PathBuf] {
        if self.is_unchecked_mode() {
            &self.unchecked_folders
        } else {
            &self.backup_folders
        }
    }

    pub fn is_database_ignored(&self, name: &str) -> bool {
        is_name_ignored(&self.ignore_databases, name)
    }

    /// `Full|Full + Logs` followed by `with recovery|no recovery`.
    pub fn mode(&self) -> String {
        format!(
            "{} {}",
            if self.full_only { "Full" } else { "Full + Logs" },
            if self.run_recovery { "with recovery" } else { "no recovery" }
        )
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.unchecked_folders.is_empty() != self.checked_folder.is_none() {
            return Err(AppError::Config(
                "unchecked_folders and checked_folder must both be defined".to_string(),
            ));
        }
        if !self.is_unchecked_mode() && self.backup_folders.is_empty() {
            return Err(AppError::Config(
                "backup_folders must be set in config.json (or use unchecked_folders with checked_folder)"
                    .to_string(),
            ));
        }
        if let Some(size) = self.max_transfer_size {
            if size > MAX_TRANSFER_SIZE_LIMIT {
                return Err(AppError::Config(format!(
                    "max_transfer_size cannot exceed {} (got {})",
                    MAX_TRANSFER_SIZE_LIMIT, size
                )));
            }
        }
        for script in &self.post_scripts {
            if !script.is_file() {
                return Err(AppError::Config(format!(
                    "post script not found: {}",
                    script.display()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReportConfig {
    pub text_path: Option<PathBuf>,
    pub json_path: Option<PathBuf>,
    pub only_on_issue: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub target_db_url: String,
    pub trust_server_certificate: bool,
    pub threads: usize,
    pub logs_path: PathBuf,
    pub restore: RestoreConfig,
    pub report: ReportConfig,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;
        Self::from_raw(raw_json_config)
    }

    pub fn from_raw(raw_json_config: RawJsonConfig) -> Result<Self> {
        // Environment (or .env) wins over the file so secrets can stay out of config.json
        let target_db_url = env::var("TARGET_DATABASE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| raw_json_config.target_database_url.clone())
            .context("target_database_url must be set in config.json or TARGET_DATABASE_URL")?;

        let threads = match raw_json_config.threads {
            Some(0) => return Err(AppError::Config("threads must be at least 1".to_string()).into()),
            Some(n) => n,
            None => std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        };

        let restore = load_restore_config_from_json(&raw_json_config)
            .context("Failed to load restore configuration from JSON")?;
        let report = load_report_config_from_json(&raw_json_config);

        Ok(AppConfig {
            target_db_url,
            trust_server_certificate: raw_json_config.trust_server_certificate.unwrap_or(false),
            threads,
            logs_path: raw_json_config
                .logs_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOGS_PATH)),
            restore,
            report,
        })
    }
}

pub fn load_restore_config_from_json(raw_config: &RawJsonConfig) -> Result<RestoreConfig> {
    let restore_opts = raw_config
        .restore
        .as_ref()
        .context("restore must be defined in config.json")?;

    let config = RestoreConfig {
        backup_folders: restore_opts.backup_folders.clone(),
        unchecked_folders: restore_opts.unchecked_folders.clone(),
        checked_folder: restore_opts.checked_folder.clone(),
        legacy: restore_opts.legacy,
        reverse_order: restore_opts.reverse_order,
        full_only: restore_opts.full_only,
        continue_logs: restore_opts.continue_logs,
        run_recovery: restore_opts.run_recovery,
        check_db: restore_opts.check_db,
        databases: parse_name_list(&restore_opts.databases).context("Invalid 'databases'")?,
        ignore_databases: parse_name_list(&restore_opts.ignore_databases)
            .context("Invalid 'ignore_databases'")?,
        post_scripts: restore_opts.post_scripts.clone(),
        post_script_filter: restore_opts
            .post_script_filter
            .clone()
            .filter(|s| !s.trim().is_empty()),
        rpo_limit_minutes: restore_opts.rpo_limit_minutes,
        max_transfer_size: restore_opts.max_transfer_size,
        buffer_count: restore_opts.buffer_count,
        no_checksum: restore_opts.no_checksum,
        stored_procedure: restore_opts.stored_procedure,
        ignore_already_present_in_msdb: restore_opts.ignore_already_present_in_msdb,
        busy_retry_delay: Duration::from_secs(
            restore_opts
                .busy_retry_delay_secs
                .unwrap_or(DEFAULT_BUSY_RETRY_DELAY_SECS),
        ),
        command_timeout: Duration::from_secs(
            raw_config
                .command_timeout_secs
                .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS),
        ),
    };
    config.validate()?;
    Ok(config)
}

pub fn load_report_config_from_json(raw_config: &RawJsonConfig) -> ReportConfig {
    raw_config
        .report
        .as_ref()
        .map(|r| ReportConfig {
            text_path: r.text_path.clone(),
            json_path: r.json_path.clone(),
            only_on_issue: r.only_on_issue,
        })
        .unwrap_or_default()
}

/// Exact or substring match against an ignore list, case-insensitive.
pub fn is_name_ignored(ignore: &[String], name: &str) -> bool {
    if ignore.is_empty() {
        return false;
    }
    let lowered = name.to_lowercase();
    ignore.iter().any(|ignored| {
        let ignored = ignored.to_lowercase();
        lowered == ignored || lowered.contains(&ignored)
    })
}

/// Parses a list of database names, given either as a JSON array or as a
/// comma-separated string.
fn parse_name_list(value: &Option<serde_json::Value>) -> Result<Vec<String>> {
    match value {
        Some(value) if value.is_array() => {
            let names: Vec<String> = serde_json::from_value(value.clone())
                .context("Failed to parse database names as array")?;
            Ok(names
                .into_iter()
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .collect())
        }
        Some(serde_json::Value::String(list)) => Ok(list
            .split(',')
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect()),
        Some(serde_json::Value::Null) | None => Ok(Vec::new()),
        Some(_) => Err(anyhow::anyhow!(
            "database list must be either an array of names or a comma-separated string"
        )),
    }
}
