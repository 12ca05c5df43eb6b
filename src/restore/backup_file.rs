// sqlrestoretool/src/restore/backup_file.rs
use chrono::{NaiveDate, NaiveDateTime};
use std::path::{Path, PathBuf};

use crate::utils::fs::{list_files_with_extension, modified_time};

pub const FULL_EXTENSION: &str = "bak";
pub const LOG_EXTENSION: &str = "trn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupFileType {
    Full,
    Diff,
    Log,
}

/// Locates the type marker in a backup file name. The last occurrence of
/// `_LOG_` wins, then `_DIFF_`, then `_FULL_`.
///
/// # Returns
/// The marker type and the byte offset right after it.
fn backup_type(name: &str) -> Option<(BackupFileType, usize)> {
    const MARKERS: [(&str, BackupFileType); 3] = [
        ("_LOG_", BackupFileType::Log),
        ("_DIFF_", BackupFileType::Diff),
        ("_FULL_", BackupFileType::Full),
    ];
    MARKERS
        .iter()
        .find_map(|(marker, kind)| name.rfind(marker).map(|i| (*kind, i + marker.len())))
}

/// Parses a `YYYYMMDD_HHMMSS` segment.
fn parse_timestamp_segment(segment: &str) -> Option<NaiveDateTime> {
    let field = |from: usize, to: usize| -> Option<u32> {
        let part = segment.get(from..to)?;
        if !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        part.parse().ok()
    };
    let year = field(0, 4)? as i32;
    let month = field(4, 6)?;
    let day = field(6, 8)?;
    let hour = field(9, 11)?;
    let minute = field(11, 13)?;
    let second = field(13, 15)?;
    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)
}

pub fn file_type_from_name(name: &str) -> Option<BackupFileType> {
    backup_type(name).map(|(kind, _)| kind)
}

/// Timestamp embedded in a backup file name, e.g. `FOO_FULL_20200819_140220.bak`.
pub fn parse_backup_name_date(name: &str) -> Option<NaiveDateTime> {
    let (_, start) = backup_type(name)?;
    parse_timestamp_segment(name.get(start..)?)
}

/// Chronological position of a backup file: the name timestamp when present,
/// otherwise the file's last-write time in local time.
pub fn backup_date(path: &Path) -> NaiveDateTime {
    file_name(path)
        .as_deref()
        .and_then(parse_backup_name_date)
        .or_else(|| modified_time(path).map(|t| t.naive_local()))
        .unwrap_or(NaiveDateTime::MIN)
}

/// Last path segment. Paths reported by the server may use `\` separators.
fn file_name(path: &Path) -> Option<String> {
    let text = path.to_string_lossy();
    text.rsplit(['/', '\\']).next().map(str::to_string)
}

/// Backup files in `dir` with the given extension, newest first.
pub fn files_newest_first(dir: &Path, extension: &str) -> std::io::Result<Vec<(PathBuf, NaiveDateTime)>> {
    let mut files: Vec<_> = list_files_with_extension(dir, extension)?
        .into_iter()
        .map(|p| {
            let date = backup_date(&p);
            (p, date)
        })
        .collect();
    files.sort_by(|a, b| b.1.cmp(&a.1));
    Ok(files)
}

pub fn newest_file(dir: &Path, extension: &str) -> std::io::Result<Option<(PathBuf, NaiveDateTime)>> {
    Ok(files_newest_first(dir, extension)?.into_iter().next())
}

/// LOG files strictly newer than `after`, newest first, so that popping
/// from the end yields them oldest first.
pub fn log_stack_after(dir: &Path, after: NaiveDateTime) -> std::io::Result<Vec<PathBuf>> {
    Ok(files_newest_first(dir, LOG_EXTENSION)?
        .into_iter()
        .filter(|(_, date)| *date > after)
        .map(|(p, _)| p)
        .collect())
}

/// True for a LOG backup: stored in a `LOG` directory or named with the
/// `_LOG_` marker.
pub fn is_log_backup(path: &Path) -> bool {
    is_in_log_folder(path)
        || file_name(path).as_deref().and_then(file_type_from_name) == Some(BackupFileType::Log)
}

/// True when the path sits in a directory named `LOG`.
fn is_in_log_folder(path: &Path) -> bool {
    let text = path.to_string_lossy();
    let mut segments = text.rsplit(['/', '\\']);
    segments.next();
    segments.next().is_some_and(|d| d.eq_ignore_ascii_case("LOG"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn test_parse_backup_name_date() {
        assert_eq!(
            parse_backup_name_date("FOO_FULL_20200819_140220.bak"),
            Some(dt("2020-08-19 14:02:20"))
        );
        assert_eq!(
            parse_backup_name_date("srv_db_LOG_20210101_000501.trn"),
            Some(dt("2021-01-01 00:05:01"))
        );
        assert_eq!(parse_backup_name_date("FOO_FULL_2020.bak"), None);
        assert_eq!(parse_backup_name_date("FOO_FULL_20201340_140220.bak"), None);
        assert_eq!(parse_backup_name_date("random.bak"), None);
    }

    #[test]
    fn test_marker_priority() {
        assert_eq!(file_type_from_name("a_FULL_x_LOG_20200101_000000.trn"), Some(BackupFileType::Log));
        assert_eq!(file_type_from_name("a_FULL_b_DIFF_20200101_000000.bak"), Some(BackupFileType::Diff));
        assert_eq!(file_type_from_name("a_FULL_20200101_000000.bak"), Some(BackupFileType::Full));
        assert_eq!(file_type_from_name("a.bak"), None);
    }

    #[test]
    fn test_malformed_name_falls_back_to_mtime() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("malformed_FULL_notadate.bak");
        fs::write(&path, b"x")?;
        let expected = modified_time(&path).unwrap().naive_local();
        assert_eq!(backup_date(&path), expected);
        Ok(())
    }

    #[test]
    fn test_log_stack_after_is_oldest_last() -> anyhow::Result<()> {
        let dir = tempdir()?;
        for name in [
            "db_LOG_20200101_000000.trn",
            "db_LOG_20200101_010000.trn",
            "db_LOG_20200101_020000.trn",
            "db_LOG_20200101_030000.trn",
        ] {
            fs::write(dir.path().join(name), b"x")?;
        }
        let mut stack = log_stack_after(dir.path(), dt("2020-01-01 01:00:00"))?;
        let first = stack.pop().unwrap();
        assert!(first.ends_with("db_LOG_20200101_020000.trn"));
        let second = stack.pop().unwrap();
        assert!(second.ends_with("db_LOG_20200101_030000.trn"));
        assert!(stack.is_empty());
        Ok(())
    }

    #[test]
    fn test_newest_file() -> anyhow::Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("db_FULL_20200101_000000.bak"), b"x")?;
        fs::write(dir.path().join("db_FULL_20200301_000000.bak"), b"x")?;
        fs::write(dir.path().join("db_FULL_20200201_000000.bak"), b"x")?;
        let (path, date) = newest_file(dir.path(), FULL_EXTENSION)?.unwrap();
        assert!(path.ends_with("db_FULL_20200301_000000.bak"));
        assert_eq!(date, dt("2020-03-01 00:00:00"));
        Ok(())
    }

    #[test]
    fn test_is_in_log_folder() {
        assert!(is_in_log_folder(Path::new("/b/db/LOG/x.trn")));
        assert!(!is_in_log_folder(Path::new("/b/db/FULL/x.bak")));
        assert!(is_in_log_folder(Path::new(r"D:\backup\db\LOG\db_LOG_20200101_000000.trn")));

        assert!(is_log_backup(Path::new(r"\\nas\logs\db_LOG_20200101_000000.trn")));
        assert!(!is_log_backup(Path::new(r"\\nas\full\db_FULL_20200101_000000.bak")));
    }

    #[test]
    fn test_server_path_date() {
        let path = Path::new(r"D:\backup\db\LOG\db_LOG_20200101_103000.trn");
        assert_eq!(backup_date(path), dt("2020-01-01 10:30:00"));
    }
}
