//! # Advisory File Locking (C1)
//!
//! Two layers, combined the way `proxmox-backup`'s datastore locker
//! combines them: an OS-level `flock` via [`fs2`] keeps out other
//! processes, and a process-local `parking_lot`-guarded map keeps out
//! other tasks within this process — `flock` is per-file-descriptor, so
//! two tasks in the same process that each open their own fd would
//! otherwise both succeed at acquiring the "same" OS lock.
//!
//! Acquisition retries with exponential backoff up to
//! [`crate::config::Config::lock_retry_attempts`] times before giving up
//! with [`AppError::LockUnavailable`].

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use parking_lot::Mutex;

use crate::errors::{AppError, AppResult};

/// Whether a held lock excludes every other holder or only other
/// exclusive holders (spec.md §4.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Exclusive,
    Shared,
}

/// Process-local bookkeeping for a path: either one exclusive holder or
/// a count of concurrent shared holders.
enum HeldState {
    Exclusive,
    Shared(u32),
}

/// Coordinates advisory locks across tasks in this process and across
/// processes on the host.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<Inner>,
    retry_attempts: u32,
    initial_delay: Duration,
}

struct Inner {
    held: Mutex<HashMap<PathBuf, HeldState>>,
}

impl LockManager {
    pub fn new(retry_attempts: u32, initial_delay_ms: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                held: Mutex::new(HashMap::new()),
            }),
            retry_attempts,
            initial_delay: Duration::from_millis(initial_delay_ms),
        }
    }

    /// Acquires an exclusive lock on `path`, creating it if absent.
    /// Retries with doubling backoff until [`Self::retry_attempts`] is
    /// exhausted, then returns [`AppError::LockUnavailable`].
    pub async fn acquire(&self, path: &Path) -> AppResult<LockGuard> {
        self.acquire_mode(path, LockMode::Exclusive).await
    }

    /// Acquires a shared (read) lock on `path`, compatible with any
    /// number of other concurrent shared holders but not with an
    /// exclusive one (spec.md §4.1).
    pub async fn acquire_shared(&self, path: &Path) -> AppResult<LockGuard> {
        self.acquire_mode(path, LockMode::Shared).await
    }

    async fn acquire_mode(&self, path: &Path, mode: LockMode) -> AppResult<LockGuard> {
        let mut delay = self.initial_delay;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.try_acquire_once(path, mode) {
                Ok(Some(guard)) => return Ok(guard),
                Ok(None) => {}
                Err(e) => return Err(e),
            }

            if attempt >= self.retry_attempts {
                return Err(AppError::LockUnavailable {
                    path: path.to_path_buf(),
                    attempts: attempt,
                });
            }

            tracing::trace!(?path, attempt, ?mode, "lock contended, backing off");
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    fn try_acquire_once(&self, path: &Path, mode: LockMode) -> AppResult<Option<LockGuard>> {
        {
            let mut held = self.inner.held.lock();
            match (held.get(path), mode) {
                (Some(HeldState::Exclusive), _) => return Ok(None),
                (Some(HeldState::Shared(_)), LockMode::Exclusive) => return Ok(None),
                (Some(HeldState::Shared(n)), LockMode::Shared) => {
                    let n = *n;
                    held.insert(path.to_path_buf(), HeldState::Shared(n + 1));
                }
                (None, LockMode::Exclusive) => {
                    held.insert(path.to_path_buf(), HeldState::Exclusive);
                }
                (None, LockMode::Shared) => {
                    held.insert(path.to_path_buf(), HeldState::Shared(1));
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .map_err(AppError::from);

        let file = match file {
            Ok(f) => f,
            Err(e) => {
                self.release_reservation(path, mode);
                return Err(e);
            }
        };

        let locked = match mode {
            LockMode::Exclusive => file.try_lock_exclusive(),
            LockMode::Shared => file.try_lock_shared(),
        };

        match locked {
            Ok(()) => Ok(Some(LockGuard {
                manager: self.clone(),
                path: path.to_path_buf(),
                mode,
                file: Some(file),
            })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                self.release_reservation(path, mode);
                Ok(None)
            }
            Err(e) => {
                self.release_reservation(path, mode);
                Err(AppError::from(e))
            }
        }
    }

    fn release_reservation(&self, path: &Path, mode: LockMode) {
        let mut held = self.inner.held.lock();
        match (held.get(path), mode) {
            (Some(HeldState::Shared(n)), LockMode::Shared) if *n > 1 => {
                let n = *n;
                held.insert(path.to_path_buf(), HeldState::Shared(n - 1));
            }
            _ => {
                held.remove(path);
            }
        }
    }
}

/// RAII guard releasing both the OS-level flock and the process-local
/// reservation on drop. Release is idempotent: dropping twice (which
/// can't happen through normal ownership, but matters if `release` is
/// called explicitly before drop) never panics.
pub struct LockGuard {
    manager: LockManager,
    path: PathBuf,
    mode: LockMode,
    file: Option<std::fs::File>,
}

impl LockGuard {
    /// Releases the lock early. Equivalent to dropping the guard, but
    /// lets a caller observe the moment release happens.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fs2::FileExt::unlock(&file);
        }
        self.manager.release_reservation(&self.path, self.mode);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn acquire_then_release_allows_reacquire() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.lock");
        let manager = LockManager::new(5, 1);

        let guard = manager.acquire(&path).await.unwrap();
        guard.release();

        let _guard2 = manager.acquire(&path).await.unwrap();
    }

    #[tokio::test]
    async fn contended_lock_times_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.lock");
        let manager = LockManager::new(3, 1);

        let _guard = manager.acquire(&path).await.unwrap();
        let err = manager.acquire(&path).await.unwrap_err();
        assert!(matches!(err, AppError::LockUnavailable { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn drop_releases_process_local_reservation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.lock");
        let manager = LockManager::new(5, 1);

        {
            let _guard = manager.acquire(&path).await.unwrap();
        }
        let _guard2 = manager.acquire(&path).await.unwrap();
    }

    #[tokio::test]
    async fn shared_locks_stack_on_the_same_manager() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.lock");
        let manager = LockManager::new(5, 1);

        let guard_a = manager.acquire_shared(&path).await.unwrap();
        let guard_b = manager.acquire_shared(&path).await.unwrap();
        drop(guard_a);
        drop(guard_b);
    }

    #[tokio::test]
    async fn exclusive_request_waits_out_an_existing_shared_holder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.lock");
        let manager = LockManager::new(3, 1);

        let shared = manager.acquire_shared(&path).await.unwrap();
        let err = manager.acquire(&path).await.unwrap_err();
        assert!(matches!(err, AppError::LockUnavailable { attempts: 3, .. }));
        shared.release();

        let _guard = manager.acquire(&path).await.unwrap();
    }

    #[tokio::test]
    async fn shared_request_waits_out_an_existing_exclusive_holder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.lock");
        let manager = LockManager::new(3, 1);

        let exclusive = manager.acquire(&path).await.unwrap();
        let err = manager.acquire_shared(&path).await.unwrap_err();
        assert!(matches!(err, AppError::LockUnavailable { attempts: 3, .. }));
        exclusive.release();

        let _guard = manager.acquire_shared(&path).await.unwrap();
    }
}
