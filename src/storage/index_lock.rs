//! Cross-process advisory lock guarding read-modify-write of the session index.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::{IoResultExt, Result, StorageError};

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Held exclusive lock on `<path>.lock`. Dropping it unlocks; the OS also
/// releases it if the process dies.
#[derive(Debug)]
pub struct IndexLockGuard {
    file: File,
    lock_path: PathBuf,
}

impl IndexLockGuard {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for IndexLockGuard {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(error = %err, path = %self.lock_path.display(), "failed to release index lock");
        }
    }
}

pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

/// Acquires the exclusive lock tied to `path`, polling until `timeout`.
pub fn acquire_index_lock(path: &Path, timeout: Duration) -> Result<IndexLockGuard> {
    let lock_path = lock_path_for(path);
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)
            .io_context(|| format!("failed to create lock directory {}", parent.display()))?;
    }
    let file = open_lock_file(&lock_path)?;

    let started = Instant::now();
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %lock_path.display(), waited = ?started.elapsed(), "index lock acquired");
                return Ok(IndexLockGuard { file, lock_path });
            }
            Err(err) if is_contended(&err) => {
                let waited = started.elapsed();
                if waited >= timeout {
                    return Err(StorageError::LockTimeout {
                        resource: lock_path.display().to_string(),
                        waited: timeout,
                    });
                }
                thread::sleep(LOCK_RETRY_INTERVAL.min(timeout - waited));
            }
            Err(err) => {
                return Err(StorageError::io(
                    format!("failed to lock {}", lock_path.display()),
                    err,
                ));
            }
        }
    }
}

/// Runs `body` while holding the index lock; the lock is released on every
/// exit path, including errors and panics.
pub fn with_index_lock<T>(
    path: &Path,
    timeout: Duration,
    body: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let _guard = acquire_index_lock(path, timeout)?;
    body()
}

pub(crate) fn is_contended(err: &io::Error) -> bool {
    let contended = fs2::lock_contended_error();
    match (err.raw_os_error(), contended.raw_os_error()) {
        (Some(code), Some(expected)) => code == expected,
        _ => err.kind() == contended.kind(),
    }
}

pub(crate) fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .io_context(|| format!("failed to open lock file {}", path.display()))
}
