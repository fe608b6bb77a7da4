// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process-wide registry of known files.
//!
//! The registry maps a record name to its [`FileRecord`] and is the single
//! source of truth for everything the API reports. It is shared by the HTTP
//! handlers, the reconciler and every fetch task, so all access goes through
//! one `RwLock`; every read-modify-write (rename and delete included) runs
//! under a single write guard.
//!
//! # Lifecycle
//!
//! ```text
//! pending (completed=false) ──▶ completed=true
//!            │
//!            └────────────────▶ errored=true
//! ```
//!
//! Records only move forward. Once terminal, backends no longer touch them.

mod locks;
pub mod reconcile;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::rate;
pub use locks::{resilient_read, resilient_write};

/// Source marker for files discovered on disk rather than fetched.
pub const LOCAL_SOURCE: &str = "Local";

/// One tracked file, fetched or local.
///
/// Serialized with the field names the web front-end expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    #[serde(rename = "FileName")]
    pub name: String,
    /// Requested URL or magnet link, or [`LOCAL_SOURCE`].
    #[serde(rename = "SourceUrl")]
    pub source: String,
    /// Last known size on disk.
    #[serde(rename = "Size")]
    pub observed_size: u64,
    /// Probed or daemon-reported total; 0 if unknown.
    #[serde(rename = "ContentLength")]
    pub expected_size: u64,
    /// Epoch seconds.
    #[serde(rename = "StartTimeStamp")]
    pub started_at: i64,
    /// Seconds, set once terminal.
    #[serde(rename = "Duration")]
    pub elapsed: i64,
    /// Bytes per second.
    #[serde(rename = "Speed")]
    pub speed: u64,
    #[serde(rename = "IsDownloaded")]
    pub completed: bool,
    #[serde(rename = "IsError")]
    pub errored: bool,
    #[serde(rename = "ErrorMessage", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileRecord {
    /// A freshly accepted fetch with a provisional name.
    pub fn pending(name: impl Into<String>, source: impl Into<String>, now: i64) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            observed_size: 0,
            expected_size: 0,
            started_at: now,
            elapsed: 0,
            speed: 0,
            completed: false,
            errored: false,
            error: None,
        }
    }

    /// A file found in the download directory.
    pub fn local(name: impl Into<String>, size: u64, modified_at: i64) -> Self {
        Self {
            name: name.into(),
            source: LOCAL_SOURCE.to_string(),
            observed_size: size,
            expected_size: size,
            started_at: modified_at,
            elapsed: 0,
            speed: 0,
            completed: true,
            errored: false,
            error: None,
        }
    }

    /// `completed` or `errored`.
    pub fn is_terminal(&self) -> bool {
        self.completed || self.errored
    }

    /// Mark the fetch finished and derive the average speed.
    ///
    /// Uses the expected size when known, otherwise `on_disk_size`.
    pub fn finish(&mut self, now: i64, on_disk_size: u64) {
        self.elapsed = (now - self.started_at).max(0);
        let bytes = if self.expected_size > 0 {
            self.expected_size
        } else {
            on_disk_size
        };
        self.speed = rate(bytes, self.elapsed);
        if on_disk_size > 0 {
            self.observed_size = on_disk_size;
        }
        self.completed = true;
    }
}

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("file {0} is still downloading")]
    StillDownloading(String),

    #[error("file {0} already exists")]
    AlreadyExists(String),

    #[error("failed to remove {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Shared handle to the record table. Cloning shares the same table.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    records: Arc<RwLock<HashMap<String, FileRecord>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new record; the key must be free.
    pub fn insert(&self, record: FileRecord) -> Result<(), RegistryError> {
        let mut records = resilient_write(&self.records);
        if records.contains_key(&record.name) {
            return Err(RegistryError::AlreadyExists(record.name));
        }
        records.insert(record.name.clone(), record);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<FileRecord> {
        resilient_read(&self.records).get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        resilient_read(&self.records).contains_key(name)
    }

    pub fn len(&self) -> usize {
        resilient_read(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consistent copy of every record, ordered by name.
    pub fn snapshot(&self) -> BTreeMap<String, FileRecord> {
        resilient_read(&self.records)
            .iter()
            .map(|(name, record)| (name.clone(), record.clone()))
            .collect()
    }

    /// Apply `f` to a record under the write lock.
    pub fn update<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut FileRecord) -> R,
    ) -> Result<R, RegistryError> {
        let mut records = resilient_write(&self.records);
        records
            .get_mut(name)
            .map(f)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Replace the key of a record, keeping every other field.
    ///
    /// Readers see either the old key or the new one, never both or neither.
    /// Fails without changes if `to` is already taken.
    pub fn rename(&self, from: &str, to: &str) -> Result<(), RegistryError> {
        if from == to {
            return if self.contains(from) {
                Ok(())
            } else {
                Err(RegistryError::NotFound(from.to_string()))
            };
        }

        let mut records = resilient_write(&self.records);
        if records.contains_key(to) {
            return Err(RegistryError::AlreadyExists(to.to_string()));
        }
        let mut record = records
            .remove(from)
            .ok_or_else(|| RegistryError::NotFound(from.to_string()))?;
        record.name = to.to_string();
        records.insert(to.to_string(), record);

        tracing::debug!(from = %from, to = %to, "Renamed record");
        Ok(())
    }

    /// Rename `from` to `to` for a fetch that started at `since`.
    ///
    /// Like [`Registry::rename`], except that a [`LOCAL_SOURCE`] record at
    /// `to` whose file appeared at or after `since` is replaced: it is the
    /// fetch's own payload, picked up by a scan before the rename.
    pub fn claim(&self, from: &str, to: &str, since: i64) -> Result<(), RegistryError> {
        if from == to {
            return self.rename(from, to);
        }

        let mut records = resilient_write(&self.records);
        if !records.contains_key(from) {
            return Err(RegistryError::NotFound(from.to_string()));
        }
        match records.get(to) {
            Some(existing) if existing.source == LOCAL_SOURCE && existing.started_at >= since => {
                tracing::debug!(name = %to, "Replacing local record with its fetch");
                records.remove(to);
            }
            Some(_) => return Err(RegistryError::AlreadyExists(to.to_string())),
            None => {}
        }
        let mut record = records
            .remove(from)
            .ok_or_else(|| RegistryError::NotFound(from.to_string()))?;
        record.name = to.to_string();
        records.insert(to.to_string(), record);

        tracing::debug!(from = %from, to = %to, "Renamed record");
        Ok(())
    }

    /// Record a terminal failure. Returns false if the record was already
    /// terminal or is gone.
    pub fn fail(&self, name: &str, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let mut records = resilient_write(&self.records);
        match records.get_mut(name) {
            Some(record) if !record.is_terminal() => {
                record.errored = true;
                record.error = Some(reason);
                true
            }
            _ => false,
        }
    }

    /// Mark a record completed (see [`FileRecord::finish`]).
    pub fn complete(&self, name: &str, now: i64, on_disk_size: u64) -> Result<(), RegistryError> {
        self.update(name, |record| {
            if !record.is_terminal() {
                record.finish(now, on_disk_size);
            }
        })
    }

    /// Delete a terminal record together with its file in `dir`.
    ///
    /// In-flight records (`completed=false, errored=false`) are refused.
    /// Errored records are deletable whether or not they completed; any
    /// partial file is removed with them. Under the write lock the file is
    /// only moved aside, so no reader sees the entry without its file; the
    /// actual removal happens after the lock is released.
    ///
    /// Blocks on the filesystem; async callers go through
    /// [`FetchEngine::delete`](crate::fetch::FetchEngine::delete).
    pub fn delete(&self, name: &str, dir: &Path) -> Result<FileRecord, RegistryError> {
        let io_error = |source| RegistryError::Io {
            name: name.to_string(),
            source,
        };

        let (record, trash) = {
            let mut records = resilient_write(&self.records);
            let record = records
                .get(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            if !record.is_terminal() {
                return Err(RegistryError::StillDownloading(name.to_string()));
            }

            let trash = reconcile::trash_path(dir);
            let trash = match fs::rename(dir.join(name), &trash) {
                Ok(()) => Some(trash),
                Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                Err(e) => return Err(io_error(e)),
            };
            let record = records
                .remove(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            (record, trash)
        };

        if let Some(trash) = trash {
            if let Err(e) = remove_path(&trash) {
                tracing::warn!(name = %name, path = ?trash, "Failed to remove deleted file: {}", e);
            }
        }
        Ok(record)
    }

    pub(crate) fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, FileRecord>> {
        resilient_write(&self.records)
    }
}

/// Remove a file or directory tree; a missing path is not an error.
fn remove_path(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
