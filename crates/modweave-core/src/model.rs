use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::UNIX_EPOCH;

use crate::hash::ContentHash;

/// Modification time and size as reported by the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub mtime_ns: i64,
    pub size: u64,
}

impl FileStat {
    pub fn of(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        let mtime_ns = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        Ok(Self {
            mtime_ns,
            size: meta.len(),
        })
    }
}

/// Full identity of one version of a file. Any field changing makes a new
/// version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub path: PathBuf,
    pub mtime_ns: i64,
    pub size: u64,
    pub content_hash: ContentHash,
}

impl Fingerprint {
    pub fn stat(&self) -> FileStat {
        FileStat {
            mtime_ns: self.mtime_ns,
            size: self.size,
        }
    }

    /// Compact form stored with queue items, used for the uniqueness check.
    pub fn token(&self) -> String {
        format!("{}:{}:{}", self.mtime_ns, self.size, self.content_hash)
    }
}

/// A file version row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: i64,
    pub root_id: String,
    /// Root-relative path with forward slashes.
    pub relative_path: String,
    pub fingerprint: Fingerprint,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Claimed,
    Complete,
    Error,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Claimed => "claimed",
            ItemStatus::Complete => "complete",
            ItemStatus::Error => "error",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "claimed" => Ok(ItemStatus::Claimed),
            "complete" => Ok(ItemStatus::Complete),
            "error" => Ok(ItemStatus::Error),
            other => Err(format!("unknown item status: {other}")),
        }
    }
}

/// Claim order class. Flash items (a file the user just touched) go before
/// any bulk work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    Flash,
}

impl Priority {
    pub fn rank(&self) -> i64 {
        match self {
            Priority::Normal => 0,
            Priority::Flash => 1,
        }
    }

    pub fn from_rank(rank: i64) -> Self {
        if rank > 0 {
            Priority::Flash
        } else {
            Priority::Normal
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub file_id: i64,
    pub envelope: String,
    pub priority: Priority,
    /// [`Fingerprint::token`] of the file version at enqueue time.
    pub fingerprint: String,
    pub status: ItemStatus,
    pub error: Option<String>,
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub(crate) fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Forward-slash path of `path` relative to `root`.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path_uses_forward_slashes() {
        let root = Path::new("/games/base");
        let path = root.join("common").join("traits").join("00_traits.txt");
        assert_eq!(
            relative_path(root, &path).as_deref(),
            Some("common/traits/00_traits.txt")
        );
        assert_eq!(relative_path(root, Path::new("/elsewhere/x.txt")), None);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Flash > Priority::Normal);
        assert_eq!(Priority::from_rank(Priority::Flash.rank()), Priority::Flash);
    }

    #[test]
    fn test_status_strings() {
        for status in [
            ItemStatus::Pending,
            ItemStatus::Claimed,
            ItemStatus::Complete,
            ItemStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<ItemStatus>().unwrap(), status);
        }
    }
}
