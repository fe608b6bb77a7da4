// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Merge the download directory into the registry.
//!
//! The directory is the ground truth for sizes. Every listing request and
//! every quota check rescans it; nothing here is cached.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;

use walkdir::WalkDir;

use super::{FileRecord, Registry};
use crate::utils::{now_epoch, rate};

/// Suffix of the control files aria2 keeps next to an unfinished download.
pub const CONTROL_FILE_SUFFIX: &str = ".aria2";

/// Prefix of files moved aside by a delete and not yet removed.
pub const TRASH_PREFIX: &str = ".dlproxy-deleting-";

static TRASH_SEQ: AtomicU64 = AtomicU64::new(0);

/// Entries the scan never turns into records.
pub fn is_ignored(name: &str) -> bool {
    name.ends_with(CONTROL_FILE_SUFFIX) || name.starts_with(TRASH_PREFIX)
}

/// Fresh path in `dir` to move a deleted entry to.
pub(crate) fn trash_path(dir: &Path) -> PathBuf {
    let seq = TRASH_SEQ.fetch_add(1, Ordering::Relaxed);
    dir.join(format!("{}{}-{}", TRASH_PREFIX, std::process::id(), seq))
}

/// One top-level entry of the download directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskEntry {
    pub name: String,
    /// File size, or the recursive size of a directory.
    pub size: u64,
    /// Modification time, epoch seconds.
    pub modified_at: i64,
}

/// List the top-level entries of `dir`.
///
/// Directories (multi-file torrents) are reported with the total size of
/// the files below them. Entries whose names are not valid UTF-8 are
/// skipped, as are aria2 control files and deletes in progress.
pub fn scan_dir(dir: &Path) -> io::Result<Vec<DiskEntry>> {
    let mut entries = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            tracing::warn!(path = ?entry.path(), "Skipping entry with non UTF-8 name");
            continue;
        };
        if is_ignored(&name) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            // Removed between read_dir and stat.
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };

        let size = if meta.is_dir() {
            dir_size(&entry.path())
        } else {
            meta.len()
        };
        let modified_at = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        entries.push(DiskEntry { name, size, modified_at });
    }

    Ok(entries)
}

/// Size of a file, or the recursive size of a directory; 0 if missing.
pub fn entry_size(path: &Path) -> u64 {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => dir_size(path),
        Ok(meta) => meta.len(),
        Err(_) => 0,
    }
}

fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

impl Registry {
    /// Scan `dir`, merge it into the registry and return aggregate usage.
    ///
    /// Blocks on the filesystem; async callers go through
    /// [`FetchEngine::usage`](crate::fetch::FetchEngine::usage).
    ///
    /// - entries without a record become `Local` records;
    /// - every matching record gets `observed_size` refreshed;
    /// - in-flight records get `speed = observed / max(1, now - started_at)`;
    /// - terminal records get `expected_size = observed_size`.
    ///
    /// The directory is scanned before the lock is taken, so an entry that
    /// was deleted in between is not resurrected.
    ///
    /// The result is the sum over on-disk entries of
    /// `max(on-disk size, expected_size)`.
    pub fn reconcile(&self, dir: &Path) -> io::Result<u64> {
        let entries = scan_dir(dir)?;
        let now = now_epoch();

        let mut records = self.write();
        let mut total = 0u64;
        for entry in entries {
            // Deleted between the scan and the lock.
            if !records.contains_key(&entry.name) && !dir.join(&entry.name).exists() {
                continue;
            }
            let record = records.entry(entry.name.clone()).or_insert_with(|| {
                tracing::info!(name = %entry.name, size = entry.size, "Discovered local file");
                FileRecord::local(entry.name.clone(), entry.size, entry.modified_at)
            });

            record.observed_size = entry.size;
            if record.is_terminal() {
                record.expected_size = record.observed_size;
            } else {
                record.speed = rate(record.observed_size, now - record.started_at);
            }
            total = total.saturating_add(entry.size.max(record.expected_size));
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LOCAL_SOURCE;
    use tempfile::TempDir;

    #[test]
    fn test_empty_dir() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::new();
        assert_eq!(registry.reconcile(dir.path()).unwrap(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_missing_dir_is_an_error() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::new();
        assert!(registry.reconcile(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_discovers_local_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.bin"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("b.bin"), vec![0u8; 20]).unwrap();

        let registry = Registry::new();
        let total = registry.reconcile(dir.path()).unwrap();

        assert_eq!(total, 30);
        assert_eq!(registry.len(), 2);
        let a = registry.get("a.bin").unwrap();
        assert_eq!(a.source, LOCAL_SOURCE);
        assert!(a.completed);
        assert_eq!(a.observed_size, 10);
        assert_eq!(a.expected_size, 10);

        // A second pass adds nothing.
        assert_eq!(registry.reconcile(dir.path()).unwrap(), 30);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_in_flight_counts_expected_size() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("big.iso"), vec![0u8; 100]).unwrap();

        let registry = Registry::new();
        let mut record = FileRecord::pending("big.iso", "http://h/big.iso", now_epoch() - 10);
        record.expected_size = 1_000;
        registry.insert(record).unwrap();

        let total = registry.reconcile(dir.path()).unwrap();
        assert_eq!(total, 1_000);

        let record = registry.get("big.iso").unwrap();
        assert_eq!(record.observed_size, 100);
        assert_eq!(record.expected_size, 1_000);
        // 100 bytes over roughly ten seconds.
        assert!(record.speed >= 9 && record.speed <= 10, "speed was {}", record.speed);
    }

    #[test]
    fn test_terminal_record_tracks_disk_size() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("shrunk.bin"), vec![0u8; 40]).unwrap();

        let registry = Registry::new();
        let mut record = FileRecord::local("shrunk.bin", 500, 0);
        record.expected_size = 500;
        registry.insert(record).unwrap();

        assert_eq!(registry.reconcile(dir.path()).unwrap(), 40);
        let record = registry.get("shrunk.bin").unwrap();
        assert_eq!(record.observed_size, 40);
        assert_eq!(record.expected_size, 40);
    }

    #[test]
    fn test_records_without_file_are_not_counted() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::new();
        let mut record = FileRecord::pending("queued", "http://h/q", now_epoch());
        record.expected_size = 5_000;
        registry.insert(record).unwrap();

        assert_eq!(registry.reconcile(dir.path()).unwrap(), 0);
        assert!(registry.contains("queued"));
    }

    #[test]
    fn test_directory_entry_uses_recursive_size() {
        let dir = TempDir::new().unwrap();
        let torrent = dir.path().join("album");
        std::fs::create_dir_all(torrent.join("disc1")).unwrap();
        std::fs::write(torrent.join("disc1").join("01.flac"), vec![0u8; 7]).unwrap();
        std::fs::write(torrent.join("cover.jpg"), vec![0u8; 3]).unwrap();

        let registry = Registry::new();
        assert_eq!(registry.reconcile(dir.path()).unwrap(), 10);
        assert_eq!(registry.get("album").unwrap().observed_size, 10);
    }

    #[test]
    fn test_every_file_has_exactly_one_matching_record() {
        let dir = TempDir::new().unwrap();
        let sizes = [0usize, 1, 4096, 12345];
        for (i, size) in sizes.iter().enumerate() {
            std::fs::write(dir.path().join(format!("f{}", i)), vec![1u8; *size]).unwrap();
        }

        let registry = Registry::new();
        registry.reconcile(dir.path()).unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), sizes.len());
        for (i, size) in sizes.iter().enumerate() {
            let record = &snapshot[&format!("f{}", i)];
            assert_eq!(record.observed_size, *size as u64);
        }
    }

    #[test]
    fn test_control_files_and_trash_are_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ubuntu.iso"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("ubuntu.iso.aria2"), vec![0u8; 3]).unwrap();
        std::fs::write(trash_path(dir.path()), vec![0u8; 5]).unwrap();

        let registry = Registry::new();
        assert_eq!(registry.reconcile(dir.path()).unwrap(), 10);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("ubuntu.iso"));
        assert!(!registry.contains("ubuntu.iso.aria2"));
    }

    #[test]
    fn test_trash_paths_are_distinct() {
        let dir = TempDir::new().unwrap();
        let first = trash_path(dir.path());
        let second = trash_path(dir.path());
        assert_ne!(first, second);
        assert!(is_ignored(first.file_name().unwrap().to_str().unwrap()));
    }
}
