//! Walking content roots and diffing them against the store.
//!
//! Discovery only reads. The worker applies a [`DiscoveryReport`]; any other
//! caller can turn one into inbox requests.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::ContentRoot;
use crate::hash::ContentHash;
use crate::inbox::Request;
use crate::model::{relative_path, FileRecord, FileStat, Fingerprint, Priority};
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Re-hash every file.
    Full,
    /// Re-hash only files whose modification time or size moved.
    #[default]
    Quick,
    /// Take the stored state as current without touching the disk.
    Trust,
}

impl ScanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanMode::Full => "full",
            ScanMode::Quick => "quick",
            ScanMode::Trust => "trust",
        }
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(ScanMode::Full),
            "quick" => Ok(ScanMode::Quick),
            "trust" => Ok(ScanMode::Trust),
            other => Err(format!("unknown scan mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Added,
    Changed,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredFile {
    pub relative_path: String,
    pub fingerprint: Fingerprint,
    pub change: Change,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedFile {
    pub relative_path: String,
    pub path: PathBuf,
    pub file_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    pub root_id: String,
    pub mode: ScanMode,
    /// Present files in relative-path order.
    pub files: Vec<DiscoveredFile>,
    pub removed: Vec<RemovedFile>,
    /// Entries that could not be read; the rest of the walk still counts.
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub added: usize,
    pub changed: usize,
    pub removed: usize,
    pub unchanged: usize,
}

impl DiscoveryReport {
    pub fn counts(&self) -> ChangeCounts {
        let mut counts = ChangeCounts {
            removed: self.removed.len(),
            ..Default::default()
        };
        for file in &self.files {
            match file.change {
                Change::Added => counts.added += 1,
                Change::Changed => counts.changed += 1,
                Change::Unchanged => counts.unchanged += 1,
            }
        }
        counts
    }

    /// Added and changed files.
    pub fn dirty(&self) -> impl Iterator<Item = &DiscoveredFile> {
        self.files.iter().filter(|f| f.change != Change::Unchanged)
    }

    /// What a read-only caller submits to have this report applied.
    pub fn to_requests(&self) -> Vec<Request> {
        self.dirty()
            .map(|f| Request::Enqueue {
                path: f.fingerprint.path.clone(),
                priority: Priority::Normal,
            })
            .chain(self.removed.iter().map(|r| Request::NotifyRemoved {
                path: r.path.clone(),
            }))
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("content root `{id}` at {path} does not exist")]
    RootMissing { id: String, path: PathBuf },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Read `path` and compute its full fingerprint. Returns the bytes so the
/// caller does not read the file twice.
pub fn fingerprint_file(path: &Path) -> Result<(Fingerprint, Vec<u8>), DiscoveryError> {
    let io_err = |source| DiscoveryError::Io {
        path: path.to_path_buf(),
        source,
    };
    let stat = FileStat::of(path).map_err(io_err)?;
    let bytes = std::fs::read(path).map_err(io_err)?;
    let fingerprint = Fingerprint {
        path: path.to_path_buf(),
        mtime_ns: stat.mtime_ns,
        // The read is authoritative if the file grew since the stat.
        size: bytes.len() as u64,
        content_hash: ContentHash::of(&bytes),
    };
    Ok((fingerprint, bytes))
}

/// Find the configured root containing `path` and the path relative to it.
/// The most specific root wins when roots nest.
pub fn locate<'a>(roots: &'a [ContentRoot], path: &Path) -> Option<(&'a ContentRoot, String)> {
    roots
        .iter()
        .filter_map(|root| relative_path(&root.path, path).map(|rel| (root, rel)))
        .min_by_key(|(_, rel)| rel.len())
}

/// Diff one content root against what the store knows about it.
pub fn discover(
    store: &Store,
    root: &ContentRoot,
    mode: ScanMode,
) -> Result<DiscoveryReport, DiscoveryError> {
    let known: HashMap<PathBuf, FileRecord> = store
        .active_files(Some(&root.id))?
        .into_iter()
        .map(|record| (record.fingerprint.path.clone(), record))
        .collect();

    let mut report = DiscoveryReport {
        root_id: root.id.clone(),
        mode,
        files: Vec::new(),
        removed: Vec::new(),
        skipped: Vec::new(),
    };

    if mode == ScanMode::Trust {
        report.files = known
            .into_values()
            .map(|record| DiscoveredFile {
                relative_path: record.relative_path,
                fingerprint: record.fingerprint,
                change: Change::Unchanged,
            })
            .collect();
        report
            .files
            .sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        debug!(root = %root.id, files = report.files.len(), "trusting stored state");
        return Ok(report);
    }

    if !root.path.is_dir() {
        return Err(DiscoveryError::RootMissing {
            id: root.id.clone(),
            path: root.path.clone(),
        });
    }

    let mut seen = std::collections::HashSet::new();
    for entry in WalkDir::new(&root.path).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(root = %root.id, error = %e, "skipping unreadable entry");
                report.skipped.push(e.to_string());
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Some(rel) = relative_path(&root.path, path) else {
            continue;
        };
        seen.insert(path.to_path_buf());

        match classify(path, known.get(path), mode) {
            Ok((fingerprint, change)) => report.files.push(DiscoveredFile {
                relative_path: rel,
                fingerprint,
                change,
            }),
            Err(e) => {
                warn!(root = %root.id, path = %rel, error = %e, "skipping file");
                report.skipped.push(format!("{rel}: {e}"));
            }
        }
    }

    report.removed = known
        .into_iter()
        .filter(|(path, _)| !seen.contains(path))
        .map(|(path, record)| RemovedFile {
            relative_path: record.relative_path,
            path,
            file_id: record.id,
        })
        .collect();
    report
        .removed
        .sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    let counts = report.counts();
    info!(
        root = %root.id,
        mode = %mode,
        added = counts.added,
        changed = counts.changed,
        removed = counts.removed,
        unchanged = counts.unchanged,
        "discovery finished"
    );
    Ok(report)
}

fn classify(
    path: &Path,
    known: Option<&FileRecord>,
    mode: ScanMode,
) -> Result<(Fingerprint, Change), DiscoveryError> {
    if mode == ScanMode::Quick {
        if let Some(record) = known {
            let stat = FileStat::of(path).map_err(|source| DiscoveryError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            if stat == record.fingerprint.stat() {
                return Ok((record.fingerprint.clone(), Change::Unchanged));
            }
        }
    }

    let (fingerprint, _) = fingerprint_file(path)?;
    let change = match known {
        None => Change::Added,
        Some(record) if record.fingerprint == fingerprint => Change::Unchanged,
        Some(_) => Change::Changed,
    };
    Ok((fingerprint, change))
}
