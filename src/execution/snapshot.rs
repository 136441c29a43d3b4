//! Snapshot & Rollback
//!
//! Records the top-level entries of a scratch directory before a stage runs so
//! that a failed stage can remove whatever it added. Rollback never restores
//! or recreates anything; it only deletes new entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum RollbackError {
    #[error("Failed to list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Top-level state of a directory at one point in time
#[derive(Debug, Clone)]
pub struct DirectorySnapshot {
    root: PathBuf,
    entries: BTreeSet<OsString>,
    captured_at: DateTime<Utc>,
}

/// Outcome of a rollback
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackReport {
    pub removed: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, String)>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

fn list_entries(root: &Path) -> Result<BTreeSet<OsString>, RollbackError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(source) => {
            return Err(RollbackError::Io {
                path: root.to_path_buf(),
                source,
            })
        }
    };

    let mut names = BTreeSet::new();
    for entry in entries {
        let entry = entry.map_err(|source| RollbackError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        names.insert(entry.file_name());
    }
    Ok(names)
}

impl DirectorySnapshot {
    /// Capture the names directly inside `root` (a missing directory is empty)
    pub fn capture(root: &Path) -> Result<Self, RollbackError> {
        let entries = list_entries(root)?;
        tracing::debug!(path = %root.display(), entries = entries.len(), "Captured snapshot");
        Ok(Self {
            root: root.to_path_buf(),
            entries,
            captured_at: Utc::now(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn contains(&self, name: &OsString) -> bool {
        self.entries.contains(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Delete every top-level entry that did not exist at capture time.
    ///
    /// Individual removal failures are collected in the report; only failing
    /// to list the directory is an error.
    pub fn rollback(&self) -> Result<RollbackReport, RollbackError> {
        let current = list_entries(&self.root)?;
        let mut report = RollbackReport::default();

        for name in current.difference(&self.entries) {
            let path = self.root.join(name);
            let result = match fs::symlink_metadata(&path) {
                Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(&path),
                Ok(_) => fs::remove_file(&path),
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => report.removed.push(path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Rollback could not remove entry");
                    report.failures.push((path, e.to_string()));
                }
            }
        }

        tracing::info!(
            path = %self.root.display(),
            removed = report.removed.len(),
            failed = report.failures.len(),
            since = %self.captured_at.to_rfc3339(),
            "Rolled back directory"
        );
        Ok(report)
    }
}
