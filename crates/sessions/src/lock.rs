//! Per-session locks.
//!
//! Two layers: an in-process keyed semaphore map serializing turns for
//! a session within one worker, and a filesystem-backed advisory lock
//! (fs2) serializing get/create/save across processes. Lock files are
//! keyed by the SHA-256 of the storage key so arbitrary session ids
//! never hit path length or charset limits.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use sf_domain::Result;

/// Cross-process advisory lock guard; unlocks on drop.
pub struct SessionFileLock {
    file: File,
}

impl Drop for SessionFileLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

pub struct SessionLockManager {
    lock_dir: PathBuf,
    local: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl SessionLockManager {
    pub fn new(lock_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(lock_dir)?;
        Ok(Self {
            lock_dir: lock_dir.to_path_buf(),
            local: Mutex::new(HashMap::new()),
        })
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.lock_dir.join(format!("{digest:x}.lock"))
    }

    /// Acquire both layers for a session key. The in-process permit is
    /// taken first so only one local task blocks on the file lock.
    pub async fn lock(&self, key: &str) -> Result<SessionGuard> {
        let semaphore = {
            let mut locks = self.local.lock();
            locks
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| sf_domain::Error::Other("session semaphore closed".into()))?;

        let path = self.lock_path(key);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        // Blocking advisory lock; contention windows are per-turn sized.
        fs2::FileExt::lock_exclusive(&file)?;

        Ok(SessionGuard {
            _permit: permit,
            _file: SessionFileLock { file },
        })
    }

    /// Number of tracked in-process session locks.
    pub fn session_count(&self) -> usize {
        self.local.lock().len()
    }

    /// Drop semaphores no task currently holds.
    pub fn prune_idle(&self) {
        let mut locks = self.local.lock();
        locks.retain(|_, semaphore| semaphore.available_permits() == 0);
    }
}

/// Holds both lock layers for the duration of a session operation.
pub struct SessionGuard {
    _permit: OwnedSemaphorePermit,
    _file: SessionFileLock,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, Arc<SessionLockManager>) {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(SessionLockManager::new(dir.path()).unwrap());
        (dir, manager)
    }

    #[tokio::test]
    async fn sequential_lock_unlock() {
        let (_dir, manager) = manager();
        let guard = manager.lock("sess-1").await.unwrap();
        drop(guard);
        let guard2 = manager.lock("sess-1").await.unwrap();
        drop(guard2);
    }

    #[tokio::test]
    async fn different_sessions_lock_concurrently() {
        let (_dir, manager) = manager();
        let g1 = manager.lock("sess-1").await.unwrap();
        let g2 = manager.lock("sess-2").await.unwrap();
        assert_eq!(manager.session_count(), 2);
        drop(g1);
        drop(g2);
    }

    #[tokio::test]
    async fn same_session_waits_for_release() {
        let (_dir, manager) = manager();
        let guard = manager.lock("sess-1").await.unwrap();

        let manager2 = manager.clone();
        let handle = tokio::spawn(async move {
            let _guard = manager2.lock("sess-1").await.unwrap();
            42
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        drop(guard);
        assert_eq!(handle.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn prune_removes_idle_locks() {
        let (_dir, manager) = manager();
        {
            let _guard = manager.lock("sess-1").await.unwrap();
        }
        manager.prune_idle();
        assert_eq!(manager.session_count(), 0);
    }
}
