// sqlrestoretool/src/restore/discovery.rs
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDateTime;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::backup_file::{FULL_EXTENSION, newest_file};
use super::item::{DuplicateExclusion, MissingFullBackup, RestoreItem};
use crate::config::{RestoreConfig, is_name_ignored};
use crate::errors::AppError;
use crate::utils::fs::{
    created_time, find_subdirectory, list_files_with_extension, list_subdirectories,
};
use crate::utils::{humanize_duration, humanize_size};

/// Inputs of a discovery pass.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryRequest {
    pub roots: Vec<PathBuf>,
    /// The unit directory itself holds the FULL backups.
    pub legacy: bool,
    pub ignore: Vec<String>,
    /// Allow-list of database names, case-insensitive. Empty keeps everything.
    pub databases: Vec<String>,
    /// Smallest FULL first.
    pub reverse: bool,
    /// Missing roots are skipped instead of failing.
    pub unchecked: bool,
    pub threads: usize,
}

impl DiscoveryRequest {
    pub fn from_config(config: &RestoreConfig, threads: usize) -> Self {
        Self {
            roots: config.source_folders().to_vec(),
            legacy: config.legacy,
            ignore: config.ignore_databases.clone(),
            databases: config.databases.clone(),
            reverse: config.reverse_order,
            unchecked: config.is_unchecked_mode(),
            threads,
        }
    }

    fn is_selected(&self, name: &str) -> bool {
        self.databases.is_empty() || self.databases.iter().any(|d| d.eq_ignore_ascii_case(name))
    }
}

/// Result of a discovery pass: the ordered work list plus what was left out.
#[derive(Debug, Default)]
pub struct Discovery {
    pub items: Vec<RestoreItem>,
    pub missing_full: Vec<MissingFullBackup>,
    pub duplicates: Vec<DuplicateExclusion>,
}

enum Scan {
    Item(RestoreItem),
    MissingFull(MissingFullBackup),
}

/// Turns the configured roots into an ordered, deduplicated work list.
pub async fn discover(request: DiscoveryRequest) -> Result<Discovery, AppError> {
    info!("Crawling folders");
    let started = Instant::now();
    let request = Arc::new(request);

    let directories = {
        let request = request.clone();
        tokio::task::spawn_blocking(move || enumerate_roots(&request))
            .await
            .map_err(|e| AppError::Restore(format!("directory enumeration failed: {}", e)))??
    };
    debug!("{} candidate directories", directories.len());

    // Per-directory scanning touches the disk several times, keep it off the runtime threads
    let limit = Arc::new(Semaphore::new(request.threads.max(1) * 4));
    let mut scans = JoinSet::new();
    for (sequence, (root_index, directory)) in directories.into_iter().enumerate() {
        let name = directory_name(&directory);
        if is_name_ignored(&request.ignore, &name) {
            debug!("Ignoring {}", directory.display());
            continue;
        }
        if !request.is_selected(&name) {
            continue;
        }
        let limit = limit.clone();
        let legacy = request.legacy;
        scans.spawn(async move {
            let _permit = limit.acquire_owned().await.ok();
            let scan = tokio::task::spawn_blocking(move || {
                scan_directory(name, root_index, &directory, legacy)
            })
            .await;
            (sequence, scan)
        });
    }

    let mut scanned = Vec::new();
    while let Some(joined) = scans.join_next().await {
        let (sequence, scan) =
            joined.map_err(|e| AppError::Restore(format!("folder scan failed: {}", e)))?;
        let scan = scan.map_err(|e| AppError::Restore(format!("folder scan failed: {}", e)))?;
        scanned.push((sequence, scan));
    }
    scanned.sort_by_key(|(sequence, _)| *sequence);

    let mut candidates = Vec::new();
    let mut missing_full = Vec::new();
    for (_, scan) in scanned {
        match scan {
            Scan::Item(item) => candidates.push(item),
            Scan::MissingFull(missing) => missing_full.push(missing),
        }
    }

    let (survivors, duplicates) = tokio::task::spawn_blocking(move || deduplicate(candidates))
        .await
        .map_err(|e| AppError::Restore(format!("duplicate detection failed: {}", e)))?;

    for dup in &duplicates {
        warn!("Duplicate found ({}) for {}", dup.count, dup.name);
        for excluded in &dup.excluded {
            warn!("Excluding {}", excluded.display());
        }
    }

    let items = order_items(survivors, request.reverse);
    info!("Crawled in {}", humanize_duration(started.elapsed(), 2));
    info!(
        "Total FULL backup size : {}",
        humanize_size(items.iter().map(|i| i.full_size).sum())
    );

    Ok(Discovery {
        items,
        missing_full,
        duplicates,
    })
}

/// Subdirectories of every root, interleaved one per root per round, each
/// tagged with the index of its root.
fn enumerate_roots(request: &DiscoveryRequest) -> Result<Vec<(usize, PathBuf)>, AppError> {
    let mut per_root = Vec::new();
    for (root_index, root) in request.roots.iter().enumerate() {
        if !root.is_dir() {
            if request.unchecked {
                warn!("Source folder {} not found, skipping", root.display());
                continue;
            }
            return Err(AppError::SourceFolder(root.clone()));
        }
        let directories =
            list_subdirectories(root).map_err(|_| AppError::SourceFolder(root.clone()))?;
        per_root.push(
            directories
                .into_iter()
                .map(|d| (root_index, d))
                .collect::<Vec<_>>(),
        );
    }
    Ok(interleave(per_root))
}

fn directory_name(directory: &Path) -> String {
    directory
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn scan_directory(name: String, root_index: usize, directory: &Path, legacy: bool) -> Scan {
    let full = if legacy {
        Some(directory.to_path_buf())
    } else {
        find_subdirectory(directory, "FULL")
    };
    let Some(full) = full.filter(|f| f.is_dir()) else {
        return Scan::MissingFull(MissingFullBackup {
            name,
            path: directory.to_path_buf(),
            created: created_time(directory),
        });
    };

    let full_size = list_files_with_extension(&full, FULL_EXTENSION)
        .unwrap_or_default()
        .iter()
        .filter_map(|f| f.metadata().ok())
        .map(|m| m.len())
        .sum();

    let mut item = RestoreItem::new(name, root_index, directory.to_path_buf(), full);
    item.full_size = full_size;
    item.diff = find_subdirectory(directory, "DIFF");
    item.log = find_subdirectory(directory, "LOG");
    Scan::Item(item)
}

/// Newest `.bak` date in the FULL folder, `None` when it holds no backup.
fn newest_full_date(item: &RestoreItem) -> Option<NaiveDateTime> {
    newest_file(&item.full, FULL_EXTENSION)
        .ok()
        .flatten()
        .map(|(_, date)| date)
}

/// Keeps one unit per name: the one whose FULL folder holds the most recent
/// backup. Ties go to the first candidate in enumeration order. A name whose
/// candidates are all empty is dropped.
fn deduplicate(candidates: Vec<RestoreItem>) -> (Vec<RestoreItem>, Vec<DuplicateExclusion>) {
    let mut groups: Vec<(String, Vec<RestoreItem>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for item in candidates {
        match index.get(&item.name) {
            Some(&i) => groups[i].1.push(item),
            None => {
                index.insert(item.name.clone(), groups.len());
                groups.push((item.name.clone(), vec![item]));
            }
        }
    }

    let mut survivors = Vec::new();
    let mut duplicates = Vec::new();
    for (name, mut group) in groups {
        if group.len() == 1 {
            survivors.append(&mut group);
            continue;
        }

        let mut best: Option<(usize, NaiveDateTime)> = None;
        for (i, item) in group.iter().enumerate() {
            if let Some(date) = newest_full_date(item) {
                if best.is_none_or(|(_, top)| date > top) {
                    best = Some((i, date));
                }
            }
        }

        let Some((keep, _)) = best else {
            warn!("Duplicate {} ({} copies) has no backup file in any copy, skipping", name, group.len());
            continue;
        };

        let count = group.len();
        let winner = group.remove(keep);
        duplicates.push(DuplicateExclusion {
            name,
            count,
            excluded: group.into_iter().map(|i| i.full).collect(),
        });
        survivors.push(winner);
    }
    (survivors, duplicates)
}

/// Largest FULL first within each root (smallest first when `reverse`), then
/// one unit per root per round.
fn order_items(items: Vec<RestoreItem>, reverse: bool) -> Vec<RestoreItem> {
    let mut per_root: Vec<(usize, Vec<RestoreItem>)> = Vec::new();
    for item in items {
        match per_root.iter_mut().find(|(root, _)| *root == item.root_index) {
            Some((_, queue)) => queue.push(item),
            None => per_root.push((item.root_index, vec![item])),
        }
    }
    per_root.sort_by_key(|(root, _)| *root);

    let queues = per_root
        .into_iter()
        .map(|(_, mut queue)| {
            if reverse {
                queue.sort_by_key(|i| i.full_size);
            } else {
                queue.sort_by(|a, b| b.full_size.cmp(&a.full_size));
            }
            queue
        })
        .collect();
    interleave(queues)
}

/// Round-robin merge: one element from each non-exhausted queue per round.
fn interleave<T>(queues: Vec<Vec<T>>) -> Vec<T> {
    let total = queues.iter().map(Vec::len).sum();
    let mut iterators: Vec<_> = queues.into_iter().map(Vec::into_iter).collect();
    let mut merged = Vec::with_capacity(total);
    while merged.len() < total {
        for iterator in iterators.iter_mut() {
            if let Some(value) = iterator.next() {
                merged.push(value);
            }
        }
    }
    merged
}
