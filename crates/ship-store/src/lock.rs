//! Single-host advisory lock on `.context.lock`.
//!
//! Acquisition is an atomic create-exclusive (`O_EXCL`) of the lock file.
//! A pid+timestamp+nonce token is written on acquisition and re-read on
//! release so one process's cleanup can never delete another process's
//! lock. Locks older than [`STALE_LOCK`] are treated as leftovers from a
//! crashed holder and taken over. Multi-process correctness is best-effort
//! single-host, not distributed.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, warn};

use crate::error::{Result, StoreError};

/// Age after which an existing lock file is considered abandoned.
pub const STALE_LOCK: Duration = Duration::from_secs(30);

/// Delay between acquisition attempts while another holder is live.
const RETRY_BACKOFF: Duration = Duration::from_millis(60);

/// A held advisory lock. Release explicitly with [`ContextLock::release`];
/// dropping performs a best-effort token-checked removal.
#[derive(Debug)]
pub struct ContextLock {
    path: PathBuf,
    token: String,
    released: bool,
}

impl ContextLock {
    /// Acquire the lock at `path`, waiting up to 2× [`STALE_LOCK`].
    ///
    /// Stale lock files (mtime older than [`STALE_LOCK`]) are deleted and
    /// re-contended. Fails with `lock_timeout` once the hard deadline
    /// passes.
    pub async fn acquire(path: &Path) -> Result<ContextLock> {
        let token = format!(
            "{}:{}:{}",
            std::process::id(),
            chrono::Utc::now().timestamp_millis(),
            uuid::Uuid::new_v4().simple()
        );
        let started = Instant::now();
        let deadline = STALE_LOCK * 2;

        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(mut file) => {
                    file.write_all(token.as_bytes())?;
                    debug!(path = %path.display(), "context lock acquired");
                    return Ok(ContextLock {
                        path: path.to_path_buf(),
                        token,
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(path) {
                        warn!(path = %path.display(), "removing stale context lock");
                        let _ = std::fs::remove_file(path);
                        continue;
                    }
                }
                Err(e) => return Err(StoreError::Io(e)),
            }

            if started.elapsed() >= deadline {
                return Err(StoreError::LockTimeout {
                    path: path.display().to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
    }

    /// Release the lock. The file is removed only if it still contains this
    /// holder's token.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents == self.token => {
                let _ = std::fs::remove_file(&self.path);
            }
            Ok(_) => {
                // Another process took the lock over (stale takeover); leave it.
                warn!(path = %self.path.display(), "lock token changed, not removing");
            }
            Err(_) => {}
        }
    }
}

impl Drop for ContextLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// `true` when the lock file's mtime is older than [`STALE_LOCK`].
///
/// A file that vanished between the existence check and the stat is treated
/// as not stale — the next create attempt will settle it.
fn lock_is_stale(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    let Ok(mtime) = meta.modified() else {
        return false;
    };
    match SystemTime::now().duration_since(mtime) {
        Ok(age) => age > STALE_LOCK,
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_writes_token_and_release_removes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".context.lock");

        let lock = ContextLock::acquire(&path).await.unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with(&std::process::id().to_string()));

        lock.release();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn stale_lock_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".context.lock");
        std::fs::write(&path, "999999:0:deadbeef").unwrap();

        // Age the file past the stale threshold.
        let old = SystemTime::now() - (STALE_LOCK + Duration::from_secs(5));
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_modified(old).unwrap();
        drop(file);

        let lock = ContextLock::acquire(&path).await.unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with(&std::process::id().to_string()));
        lock.release();
    }

    #[tokio::test]
    async fn release_leaves_foreign_token_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".context.lock");

        let lock = ContextLock::acquire(&path).await.unwrap();
        // Simulate a stale takeover by another process.
        std::fs::write(&path, "someone-else").unwrap();
        lock.release();
        assert!(path.exists());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "someone-else");
    }

    #[tokio::test]
    async fn drop_releases_like_explicit_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".context.lock");
        {
            let _lock = ContextLock::acquire(&path).await.unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
