use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::fs;

use crate::discovery::ScanMode;
use crate::model::Priority;

/// Work a caller asks the worker to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Enqueue {
        path: PathBuf,
        priority: Priority,
    },
    /// Scan one root, or every active root when `root` is `None`.
    Scan {
        root: Option<String>,
        mode: ScanMode,
    },
    NotifyRemoved {
        path: PathBuf,
    },
    Retry {
        item_id: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxRequest {
    pub id: String,
    pub submitted_at: DateTime<Utc>,
    pub request: Request,
}

#[derive(Debug, Error)]
pub enum InboxError {
    #[error("inbox I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

trait IoContext<T> {
    fn at(self, path: &Path) -> Result<T, InboxError>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: &Path) -> Result<T, InboxError> {
        self.map_err(|source| InboxError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Request id: millisecond timestamp, a per-process sequence and a random
/// suffix, so names sort in submission order.
pub fn generate_request_id() -> String {
    let ts = Utc::now().timestamp_millis();
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed) % 1_000_000;
    let rand: String = uuid::Uuid::new_v4().to_string()[..7].to_string();
    format!("{ts:013}_{seq:06}_{rand}")
}

/// File-backed request queue between callers and the worker.
pub struct Inbox {
    pub pending: PathBuf,
    pub processing: PathBuf,
    pub failed: PathBuf,
}

impl Inbox {
    pub async fn new(base: impl AsRef<Path>) -> Result<Self, InboxError> {
        let base = base.as_ref().to_path_buf();
        let pending = base.join("pending");
        let processing = base.join("processing");
        let failed = base.join("failed");

        for dir in [&pending, &processing, &failed] {
            fs::create_dir_all(dir).await.at(dir)?;
        }

        Ok(Self {
            pending,
            processing,
            failed,
        })
    }

    /// Write a request for the worker. Uses tmp+rename so the worker never
    /// sees a partial file.
    pub async fn submit(&self, request: Request) -> Result<InboxRequest, InboxError> {
        let envelope = InboxRequest {
            id: generate_request_id(),
            submitted_at: Utc::now(),
            request,
        };
        let filename = format!("{}.json", envelope.id);
        let path = self.pending.join(&filename);
        let tmp = self.pending.join(format!(".{}.tmp", filename));
        let content = serde_json::to_string_pretty(&envelope)?;
        fs::write(&tmp, &content).await.at(&tmp)?;
        fs::rename(&tmp, &path).await.at(&path)?;
        tracing::debug!(request_id = %envelope.id, "submitted inbox request");
        Ok(envelope)
    }

    /// Claim the oldest pending request by moving it into processing/.
    /// Unreadable files go to failed/ so they cannot block the queue.
    pub async fn claim_next(&self) -> Result<Option<(PathBuf, InboxRequest)>, InboxError> {
        let mut names = Vec::new();
        let mut dir = fs::read_dir(&self.pending).await.at(&self.pending)?;
        while let Some(entry) = dir.next_entry().await.at(&self.pending)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            // Skip temp files
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            names.push(name);
        }

        // Names start with a zero-padded timestamp: sorted = FIFO
        names.sort();

        for name in names {
            let path = self.pending.join(&name);
            let processing_path = self.processing.join(&name);

            // Another drainer may have taken it first.
            if fs::rename(&path, &processing_path).await.is_err() {
                continue;
            }

            let parsed = match fs::read_to_string(&processing_path).await {
                Ok(content) => serde_json::from_str::<InboxRequest>(&content)
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match parsed {
                Ok(request) => return Ok(Some((processing_path, request))),
                Err(e) => {
                    tracing::error!(file = %name, error = %e, "unreadable inbox request");
                    let _ = fs::rename(&processing_path, self.failed.join(&name)).await;
                }
            }
        }

        Ok(None)
    }

    /// The request has been applied.
    pub async fn ack(&self, processing_path: &Path) -> Result<(), InboxError> {
        fs::remove_file(processing_path).await.at(processing_path)
    }

    /// The request could not be applied; keep it for inspection.
    pub async fn reject(&self, processing_path: &Path, reason: &str) -> Result<(), InboxError> {
        tracing::warn!(file = %processing_path.display(), reason, "rejected inbox request");
        if let Some(filename) = processing_path.file_name() {
            let dest = self.failed.join(filename);
            fs::rename(processing_path, &dest).await.at(&dest)?;
        }
        Ok(())
    }

    /// Move requests a crashed worker left in processing/ back to pending/.
    pub async fn recover(&self) -> Result<usize, InboxError> {
        let mut recovered = 0;
        let mut dir = fs::read_dir(&self.processing).await.at(&self.processing)?;
        while let Some(entry) = dir.next_entry().await.at(&self.processing)? {
            let dest = self.pending.join(entry.file_name());
            fs::rename(entry.path(), &dest).await.at(&dest)?;
            recovered += 1;
        }
        if recovered > 0 {
            tracing::info!(recovered, "returned interrupted inbox requests to pending");
        }
        Ok(recovered)
    }

    pub async fn pending_count(&self) -> Result<usize, InboxError> {
        let mut count = 0;
        let mut dir = fs::read_dir(&self.pending).await.at(&self.pending)?;
        while let Some(entry) = dir.next_entry().await.at(&self.pending)? {
            if !entry.file_name().to_string_lossy().starts_with('.') {
                count += 1;
            }
        }
        Ok(count)
    }
}
