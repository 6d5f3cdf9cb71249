use cadence_core::LockError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const LOCK_DIR_NAME: &str = ".cadence";
const LOCK_FILE_NAME: &str = "develop.lock";

/// Tuning for [`DevelopLock::acquire`].
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// A holder older than this is reported as stale. The OS drops the lock
    /// when the holder dies, so this only affects diagnostics.
    pub stale_ms: u64,
    /// Extra attempts after the first one fails.
    pub retries: u32,
    /// Sleep between attempts.
    pub retry_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            stale_ms: 60_000,
            retries: 3,
            retry_interval: Duration::from_millis(500),
        }
    }
}

/// Who holds the lock. Written into the lock file after acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Cross-process exclusive lock over a repository's develop branch.
///
/// Backed by `flock(LOCK_EX | LOCK_NB)` on `{repo}/.cadence/develop.lock`.
pub struct DevelopLock;

impl DevelopLock {
    /// Path of the lock file for `repo_root`.
    pub fn lock_path(repo_root: &Path) -> PathBuf {
        repo_root.join(LOCK_DIR_NAME).join(LOCK_FILE_NAME)
    }

    /// Try once without waiting. `Ok(None)` when another holder has it.
    pub fn try_acquire(repo_root: &Path) -> Result<Option<LockGuard>, LockError> {
        let path = Self::lock_path(repo_root);
        let file = open_lock_file(&path).map_err(|e| {
            LockError(format!(
                "Failed to acquire develop lock: cannot open {}: {e}",
                path.display()
            ))
        })?;
        match try_flock_exclusive(&file) {
            Ok(true) => {
                let mut guard = LockGuard {
                    file: Some(file),
                    path,
                };
                if let Err(e) = guard.write_holder() {
                    warn!(path = %guard.path.display(), error = %e, "Failed to record lock holder");
                }
                Ok(Some(guard))
            }
            Ok(false) => Ok(None),
            Err(e) => Err(LockError(format!(
                "Failed to acquire develop lock: flock on {}: {e}",
                path.display()
            ))),
        }
    }

    /// Acquire the lock, retrying `options.retries` times.
    ///
    /// Fails with a [`LockError`] (always retryable) if the lock is still
    /// held after the last attempt.
    pub async fn acquire(repo_root: &Path, options: &LockOptions) -> Result<LockGuard, LockError> {
        let mut attempt = 0;
        loop {
            if let Some(guard) = Self::try_acquire(repo_root)? {
                info!(repo = %repo_root.display(), attempt, "Develop lock acquired");
                return Ok(guard);
            }

            let holder = Self::holder(repo_root);
            if let Some(h) = &holder {
                let held_ms = (Utc::now() - h.acquired_at).num_milliseconds();
                if held_ms > options.stale_ms as i64 {
                    warn!(
                        repo = %repo_root.display(),
                        pid = h.pid,
                        held_ms,
                        "Develop lock holder exceeds stale threshold"
                    );
                }
            }

            if attempt >= options.retries {
                let who = holder
                    .map(|h| format!("pid {} since {}", h.pid, h.acquired_at.to_rfc3339()))
                    .unwrap_or_else(|| "another process".to_string());
                return Err(LockError(format!(
                    "Failed to acquire develop lock: held by {who}"
                )));
            }
            attempt += 1;
            debug!(repo = %repo_root.display(), attempt, "Develop lock busy, retrying");
            tokio::time::sleep(options.retry_interval).await;
        }
    }

    /// Whether some holder currently has the lock.
    pub fn is_locked(repo_root: &Path) -> bool {
        let path = Self::lock_path(repo_root);
        let Ok(file) = OpenOptions::new().read(true).write(true).open(&path) else {
            return false;
        };
        // Acquiring and immediately dropping tells us it was free.
        matches!(try_flock_exclusive(&file), Ok(false))
    }

    /// Last recorded holder, if the lock file has one.
    pub fn holder(repo_root: &Path) -> Option<LockHolder> {
        let mut contents = String::new();
        File::open(Self::lock_path(repo_root))
            .ok()?
            .read_to_string(&mut contents)
            .ok()?;
        serde_json::from_str(contents.trim()).ok()
    }
}

/// Holds the develop lock until released or dropped.
pub struct LockGuard {
    file: Option<File>,
    path: PathBuf,
}

impl LockGuard {
    fn write_holder(&mut self) -> io::Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        let holder = LockHolder {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let json = serde_json::to_string(&holder).map_err(io::Error::other)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(json.as_bytes())?;
        file.flush()
    }

    /// Release explicitly. Dropping the guard has the same effect.
    pub fn release(mut self) {
        self.unlock();
    }

    fn unlock(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.set_len(0) {
                debug!(path = %self.path.display(), error = %e, "Failed to clear lock holder");
            }
            // Closing the descriptor releases the flock.
            drop(file);
            info!(path = %self.path.display(), "Develop lock released");
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.unlock();
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
}

/// Try to take an exclusive flock without blocking.
///
/// `Ok(false)` means another open file description holds it.
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd is a valid descriptor owned by `file` for the duration of
        // the call; LOCK_EX | LOCK_NB never blocks.
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK)
        {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "develop lock requires flock",
        ))
    }
}

#[cfg(all(test, not(unix)))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod unsupported_tests {
    use super::*;

    #[test]
    fn test_lock_is_refused_without_flock() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = File::create(tmp.path().join("develop.lock")).unwrap();
        let err = try_flock_exclusive(&file).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
