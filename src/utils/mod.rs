// sqlrestoretool/src/utils/mod.rs
pub mod fs;
pub mod logging;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use which::which;

/// Finds the sqlcmd executable in the system PATH.
pub fn find_sqlcmd_executable() -> Result<PathBuf> {
    which("sqlcmd").context("sqlcmd executable not found in PATH. Please ensure SQL Server command line tools (mssql-tools18) are installed and in your PATH.")
}

/// Renders a duration with at most `parts` units, largest first: `1d 2h`, `3m 4s`, `250ms`.
pub fn humanize_duration(duration: Duration, parts: usize) -> String {
    let total_secs = duration.as_secs();
    let mut parts = parts;
    let mut out: Vec<String> = Vec::new();

    let days = total_secs / 86_400;
    let hours = (total_secs / 3_600) % 24;
    let minutes = (total_secs / 60) % 60;
    let seconds = total_secs % 60;
    let millis = duration.subsec_millis();

    if total_secs >= 86_400 && parts > 0 {
        out.push(format!("{}d", days));
        parts -= 1;
    }
    if total_secs >= 3_600 && parts > 0 {
        out.push(format!("{}h", hours));
        parts -= 1;
    }
    if total_secs >= 60 && parts > 0 {
        out.push(format!("{}m", minutes));
        parts -= 1;
    }
    if seconds >= 1 && parts > 0 {
        out.push(format!("{}s", seconds));
        parts -= 1;
    }
    if millis >= 1 && parts > 0 {
        out.push(format!("{}ms", millis));
    }
    out.join(" ")
}

/// Renders a byte count with binary multiples: `0B`, `512 B`, `1.5 Go`.
pub fn humanize_size(size: u64) -> String {
    const SUFFIXES: [&str; 7] = ["B", "Ko", "Mo", "Go", "To", "Po", "Eo"];
    if size == 0 {
        return format!("0{}", SUFFIXES[0]);
    }
    let bytes = size as f64;
    let place = (bytes.ln() / 1024f64.ln()).floor() as usize;
    let place = place.min(SUFFIXES.len() - 1);
    let num = (bytes / 1024f64.powi(place as i32) * 10.0).round() / 10.0;
    format!("{} {}", num, SUFFIXES[place])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_humanize_duration_keeps_two_largest_units() {
        let d = Duration::from_secs(86_400 + 2 * 3_600 + 5 * 60 + 7);
        assert_eq!(humanize_duration(d, 2), "1d 2h");
        assert_eq!(humanize_duration(Duration::from_secs(65), 2), "1m 5s");
        assert_eq!(humanize_duration(Duration::from_millis(250), 2), "250ms");
        assert_eq!(humanize_duration(Duration::from_secs(3_600), 2), "1h 0m");
        assert_eq!(humanize_duration(Duration::ZERO, 2), "");
    }

    #[test]
    fn test_humanize_size() {
        assert_eq!(humanize_size(0), "0B");
        assert_eq!(humanize_size(512), "512 B");
        assert_eq!(humanize_size(1536), "1.5 Ko");
        assert_eq!(humanize_size(3 * 1024 * 1024 * 1024), "3 Go");
    }
}
