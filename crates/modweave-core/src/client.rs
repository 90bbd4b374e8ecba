use std::path::{Path, PathBuf};

use crate::discovery::{DiscoveryReport, ScanMode};
use crate::inbox::{Inbox, InboxError, InboxRequest, Request};
use crate::model::Priority;

/// The enqueue surface. Every call is a fire-and-forget inbox write; the
/// worker does the work whenever it next drains the inbox.
pub struct Client {
    inbox: Inbox,
}

impl Client {
    pub async fn open(data_dir: &Path) -> Result<Self, InboxError> {
        Ok(Self {
            inbox: Inbox::new(inbox_dir(data_dir)).await?,
        })
    }

    pub async fn enqueue(
        &self,
        path: &Path,
        priority: Priority,
    ) -> Result<InboxRequest, InboxError> {
        self.inbox
            .submit(Request::Enqueue {
                path: absolute(path),
                priority,
            })
            .await
    }

    /// Scan `root`, or every active root for `None`.
    pub async fn enqueue_scan(
        &self,
        root: Option<&str>,
        mode: ScanMode,
    ) -> Result<InboxRequest, InboxError> {
        self.inbox
            .submit(Request::Scan {
                root: root.map(str::to_string),
                mode,
            })
            .await
    }

    pub async fn notify_removed(&self, path: &Path) -> Result<InboxRequest, InboxError> {
        self.inbox
            .submit(Request::NotifyRemoved {
                path: absolute(path),
            })
            .await
    }

    pub async fn retry(&self, item_id: i64) -> Result<InboxRequest, InboxError> {
        self.inbox.submit(Request::Retry { item_id }).await
    }

    /// Ask the worker to apply a report computed by a read-only caller.
    pub async fn submit_report(
        &self,
        report: &DiscoveryReport,
    ) -> Result<Vec<InboxRequest>, InboxError> {
        let mut submitted = Vec::new();
        for request in report.to_requests() {
            submitted.push(self.inbox.submit(request).await?);
        }
        Ok(submitted)
    }

    pub async fn pending(&self) -> Result<usize, InboxError> {
        self.inbox.pending_count().await
    }
}

pub fn inbox_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("inbox")
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_calls_become_inbox_requests() {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::open(dir.path()).await.unwrap();
        client
            .enqueue(&dir.path().join("x.txt"), Priority::Flash)
            .await
            .unwrap();
        client.enqueue_scan(Some("game"), ScanMode::Full).await.unwrap();
        client.notify_removed(&dir.path().join("gone.txt")).await.unwrap();
        client.retry(7).await.unwrap();
        assert_eq!(client.pending().await.unwrap(), 4);

        let inbox = Inbox::new(inbox_dir(dir.path())).await.unwrap();
        let (_, first) = inbox.claim_next().await.unwrap().unwrap();
        assert_eq!(
            first.request,
            Request::Enqueue {
                path: dir.path().join("x.txt"),
                priority: Priority::Flash
            }
        );
    }

    #[test]
    fn test_relative_paths_are_made_absolute() {
        assert!(absolute(Path::new("mods/a.txt")).is_absolute());
    }
}
