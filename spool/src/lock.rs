//! Per-dataset locking for the spool.
//!
//! Two layers: an in-process async mutex serializes tasks of this process,
//! and a `staging.lock` file guards against another process opening the same
//! dataset database.

use crate::{Error, Result};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::warn;

/// Mutable per-dataset state guarded by the dataset lock.
#[derive(Debug, Default)]
pub(crate) struct DatasetState {
    /// Whether crash recovery ran for this dataset in this process.
    pub(crate) recovered: bool,
    /// Set when the dataset was quarantined; cleared once reopened.
    pub(crate) corrupted_reason: Option<String>,
}

/// Registry of per-dataset in-process locks, keyed by slug.
#[derive(Debug, Default)]
pub(crate) struct DatasetLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<DatasetState>>>>,
}

impl DatasetLocks {
    /// The lock for `slug`, created on first use.
    pub(crate) fn get(&self, slug: &str) -> Arc<tokio::sync::Mutex<DatasetState>> {
        let mut locks = self.locks.lock();
        Arc::clone(
            locks
                .entry(slug.to_string())
                .or_insert_with(Default::default),
        )
    }
}

/// How long to wait between attempts to take the lock file.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// A held `staging.lock` file; removed on drop.
#[derive(Debug)]
pub(crate) struct FsLock {
    path: PathBuf,
}

impl FsLock {
    /// Take the lock file at `path`, retrying for up to `timeout`.
    pub(crate) async fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(file) => {
                    // the pid helps operators identify a stale holder
                    use std::io::Write;
                    let mut file = file;
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(Error::LockTimeout {
                            path: path.to_path_buf(),
                        });
                    }
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                Err(source) => return Err(Error::Io { source }),
            }
        }
    }
}

impl Drop for FsLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path=%self.path.display(), %e, "failed to remove staging lock file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn lock_file_is_exclusive_and_released_on_drop() {
        let dir = test_helpers::tmp_dir().unwrap();
        let path = dir.path().join("staging.lock");

        let held = FsLock::acquire(&path, Duration::from_millis(100)).await.unwrap();

        let err = FsLock::acquire(&path, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_matches!(err, Error::LockTimeout { .. });

        drop(held);
        assert!(!path.exists());
        FsLock::acquire(&path, Duration::from_millis(100)).await.unwrap();
    }
}
