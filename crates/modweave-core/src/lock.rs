//! Single-writer lock for a store.
//!
//! The worker takes an exclusive advisory lock on `<store>.writer.lock`
//! before it opens the store for writing. The lock is separate from
//! SQLite's own locking: it decides who may write at all. A JSON sidecar
//! next to it names the holder for operators.

use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("store {store} already has a writer{}", holder_suffix(.holder))]
    Held {
        store: PathBuf,
        holder: Option<LockHolder>,
    },

    #[error("failed to create lock file {path}: {source}")]
    CreateFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to acquire lock: {0}")]
    AcquireFailed(#[source] io::Error),
}

fn holder_suffix(holder: &Option<LockHolder>) -> String {
    match holder {
        Some(h) => format!(" (pid {} since {})", h.pid, h.started_at),
        None => String::new(),
    }
}

/// Contents of the sidecar file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub exe: Option<String>,
    pub started_at: String,
}

/// Held write authority over one store. Released on drop.
pub struct WriterLock {
    _file: File,
    store_path: PathBuf,
    lock_path: PathBuf,
    sidecar_path: Option<PathBuf>,
}

impl WriterLock {
    /// Try once, without blocking.
    pub fn acquire(store_path: &Path) -> Result<Self, LockError> {
        let lock_path = lock_path_for(store_path);
        debug!(path = %lock_path.display(), "acquiring writer lock");

        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).map_err(|source| LockError::CreateFailed {
                path: lock_path.clone(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|source| LockError::CreateFailed {
                path: lock_path.clone(),
                source,
            })?;

        // Fully qualified so the fs2 method is used rather than the newer
        // std `File::try_lock_exclusive`.
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                info!(path = %lock_path.display(), "acquired writer lock");
                let sidecar_path = write_sidecar(&lock_path);
                Ok(Self {
                    _file: file,
                    store_path: store_path.to_path_buf(),
                    lock_path,
                    sidecar_path,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(LockError::Held {
                store: store_path.to_path_buf(),
                holder: read_holder(store_path),
            }),
            Err(e) => Err(LockError::AcquireFailed(e)),
        }
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        debug!(path = %self.lock_path.display(), "releasing writer lock");
        if let Some(path) = &self.sidecar_path {
            if let Err(e) = fs::remove_file(path) {
                debug!(path = %path.display(), error = %e, "failed to remove lock sidecar");
            }
        }
    }
}

impl std::fmt::Debug for WriterLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterLock")
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

/// `/data/store.db` → `/data/store.db.writer.lock`
pub fn lock_path_for(store_path: &Path) -> PathBuf {
    let mut name = store_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "store".into());
    name.push(".writer.lock");
    store_path.with_file_name(name)
}

fn sidecar_path_for(lock_path: &Path) -> PathBuf {
    let mut name = lock_path.as_os_str().to_os_string();
    name.push(".json");
    PathBuf::from(name)
}

fn write_sidecar(lock_path: &Path) -> Option<PathBuf> {
    let holder = LockHolder {
        pid: std::process::id(),
        exe: std::env::current_exe().ok().map(|p| p.display().to_string()),
        started_at: Utc::now().to_rfc3339(),
    };
    let sidecar_path = sidecar_path_for(lock_path);
    match serde_json::to_vec_pretty(&holder)
        .map_err(io::Error::other)
        .and_then(|payload| fs::write(&sidecar_path, payload))
    {
        Ok(()) => Some(sidecar_path),
        Err(e) => {
            warn!(path = %sidecar_path.display(), error = %e, "failed to write lock sidecar");
            None
        }
    }
}

/// Who holds the writer lock of `store_path`, as far as the sidecar says.
pub fn read_holder(store_path: &Path) -> Option<LockHolder> {
    let content = fs::read(sidecar_path_for(&lock_path_for(store_path))).ok()?;
    serde_json::from_slice(&content).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_path_for() {
        assert_eq!(
            lock_path_for(Path::new("/data/store.db")),
            PathBuf::from("/data/store.db.writer.lock")
        );
    }

    #[test]
    fn test_second_writer_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("store.db");

        let first = WriterLock::acquire(&store).unwrap();
        let holder = read_holder(&store).unwrap();
        assert_eq!(holder.pid, std::process::id());

        match WriterLock::acquire(&store) {
            Err(LockError::Held { holder, .. }) => {
                assert_eq!(holder.unwrap().pid, std::process::id())
            }
            other => panic!("expected Held, got {other:?}"),
        }

        drop(first);
        assert!(read_holder(&store).is_none());
        let again = WriterLock::acquire(&store).unwrap();
        assert_eq!(again.store_path(), store.as_path());
    }
}
