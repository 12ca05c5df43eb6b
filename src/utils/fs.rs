// sqlrestoretool/src/utils/fs.rs
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Immediate subdirectories of `root`, sorted by name.
pub fn list_subdirectories(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(dirs)
}

/// Looks up a direct child directory by name, case-insensitively.
/// An exact-case match wins over a case-folded one.
pub fn find_subdirectory(dir: &Path, name: &str) -> Option<PathBuf> {
    let exact = dir.join(name);
    if exact.is_dir() {
        return Some(exact);
    }
    list_subdirectories(dir).ok()?.into_iter().find(|p| {
        p.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.eq_ignore_ascii_case(name))
    })
}

/// Regular files directly under `dir` whose extension matches `extension`
/// (case-insensitive, without the dot). A missing directory yields nothing.
pub fn list_files_with_extension(dir: &Path, extension: &str) -> std::io::Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(extension));
        if matches {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub fn modified_time(path: &Path) -> Option<DateTime<Local>> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Local>::from)
}

/// Creation time of `path`, or its modification time on filesystems that do
/// not record birth time.
pub fn created_time(path: &Path) -> Option<DateTime<Local>> {
    let metadata = fs::metadata(path).ok()?;
    metadata
        .created()
        .or_else(|_| metadata.modified())
        .ok()
        .map(DateTime::<Local>::from)
}

/// First free path of the form `dest_dir/name`, `dest_dir/name_1`, `dest_dir/name_2`, ...
pub fn unique_destination(dest_dir: &Path, name: &str) -> PathBuf {
    let candidate = dest_dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let mut suffix = 1;
    loop {
        let candidate = dest_dir.join(format!("{}_{}", name, suffix));
        if !candidate.exists() {
            return candidate;
        }
        suffix += 1;
    }
}

/// Moves `source` into `dest_dir`, renaming on conflict.
///
/// Falls back to copy + delete when a plain rename is not possible
/// (typically across filesystems).
///
/// # Returns
/// The final location of the directory.
pub fn move_directory(source: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let name = source
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Invalid directory name: {}", source.display()))?;

    fs::create_dir_all(dest_dir)
        .with_context(|| format!("Failed to create directory: {}", dest_dir.display()))?;
    let target = unique_destination(dest_dir, name);

    if fs::rename(source, &target).is_ok() {
        return Ok(target);
    }

    copy_directory(source, &target)?;
    remove_directory(source)?;
    Ok(target)
}

/// Recursively copies `source` into a new directory `target`.
pub fn copy_directory(source: &Path, target: &Path) -> Result<()> {
    for entry in WalkDir::new(source) {
        let entry =
            entry.with_context(|| format!("Failed to walk directory: {}", source.display()))?;
        let path = entry.path();
        let relative = path.strip_prefix(source).with_context(|| {
            format!(
                "Failed to strip prefix {} from {}",
                source.display(),
                path.display()
            )
        })?;
        let destination = target.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&destination).with_context(|| {
                format!("Failed to create directory: {}", destination.display())
            })?;
        } else {
            fs::copy(path, &destination).with_context(|| {
                format!(
                    "Failed to copy {} to {}",
                    path.display(),
                    destination.display()
                )
            })?;
        }
    }
    Ok(())
}

pub fn remove_directory(path: &Path) -> Result<()> {
    fs::remove_dir_all(path)
        .with_context(|| format!("Failed to delete directory: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_list_subdirectories_sorted() -> anyhow::Result<()> {
        let root = tempdir()?;
        for name in ["zeta", "alpha", "mid"] {
            fs::create_dir(root.path().join(name))?;
        }
        fs::write(root.path().join("file.txt"), b"x")?;

        let dirs = list_subdirectories(root.path())?;
        let names: Vec<_> = dirs
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
        Ok(())
    }

    #[test]
    fn test_find_subdirectory_case_insensitive() -> anyhow::Result<()> {
        let root = tempdir()?;
        fs::create_dir(root.path().join("Full"))?;
        assert!(find_subdirectory(root.path(), "FULL").is_some());
        assert!(find_subdirectory(root.path(), "LOG").is_none());
        Ok(())
    }

    #[test]
    fn test_list_files_with_extension() -> anyhow::Result<()> {
        let root = tempdir()?;
        fs::write(root.path().join("a.bak"), b"1")?;
        fs::write(root.path().join("b.BAK"), b"1")?;
        fs::write(root.path().join("c.trn"), b"1")?;
        assert_eq!(list_files_with_extension(root.path(), "bak")?.len(), 2);
        assert_eq!(list_files_with_extension(root.path(), "trn")?.len(), 1);
        assert!(list_files_with_extension(&root.path().join("missing"), "bak")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_move_directory_renames_on_conflict() -> anyhow::Result<()> {
        let root = tempdir()?;
        let checked = root.path().join("checked");
        fs::create_dir_all(checked.join("db1"))?;
        fs::create_dir_all(checked.join("db1_1"))?;

        let source = root.path().join("unchecked").join("db1");
        fs::create_dir_all(source.join("FULL"))?;
        fs::write(source.join("FULL").join("db1_FULL_20200101_000000.bak"), b"data")?;

        let moved = move_directory(&source, &checked)?;
        assert_eq!(moved, checked.join("db1_2"));
        assert!(!source.exists());
        assert!(moved.join("FULL").join("db1_FULL_20200101_000000.bak").is_file());
        Ok(())
    }

    #[test]
    fn test_copy_and_remove_directory() -> anyhow::Result<()> {
        let root = tempdir()?;
        let source = root.path().join("src");
        fs::create_dir_all(source.join("LOG"))?;
        fs::write(source.join("LOG").join("x.trn"), b"log")?;

        let target = root.path().join("dst");
        copy_directory(&source, &target)?;
        assert_eq!(fs::read(target.join("LOG").join("x.trn"))?, b"log");

        remove_directory(&source)?;
        assert!(!source.exists());
        assert!(target.join("LOG").is_dir());
        Ok(())
    }
}
