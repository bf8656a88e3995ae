//! Writer liveness lock.
//!
//! A session's writer holds an exclusive lock on `sessions/<id>.lock` for as
//! long as it owns the session. The lock is the authoritative "is this session
//! active" signal: it disappears with the writer, even if the writer process
//! crashes before it can finalize.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{IoResultExt, Result, StorageError};
use crate::storage::index_lock::{is_contended, open_lock_file};

#[derive(Debug)]
pub struct WriterGuard {
    file: File,
    lock_path: PathBuf,
    pid: u32,
}

impl WriterGuard {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Debug)]
pub enum AcquireState {
    Acquired(WriterGuard),
    AlreadyHeld { pid: Option<u32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Idle,
    Running { pid: Option<u32> },
}

impl WriterState {
    pub fn is_running(self) -> bool {
        matches!(self, Self::Running { .. })
    }
}

pub fn acquire_writer_lock(lock_path: &Path) -> Result<AcquireState> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)
            .io_context(|| format!("failed to create lock directory {}", parent.display()))?;
    }

    let mut file = open_lock_file(lock_path)?;
    match file.try_lock_exclusive() {
        Ok(()) => {
            write_pid(&mut file)
                .io_context(|| format!("failed to record writer pid in {}", lock_path.display()))?;
            Ok(AcquireState::Acquired(WriterGuard {
                file,
                lock_path: lock_path.to_path_buf(),
                pid: std::process::id(),
            }))
        }
        Err(err) if is_contended(&err) => Ok(AcquireState::AlreadyHeld {
            pid: read_pid(lock_path),
        }),
        Err(err) => Err(StorageError::io(
            format!("failed to lock {}", lock_path.display()),
            err,
        )),
    }
}

/// Non-blocking check: takes and immediately drops the lock if it is free.
pub fn inspect_writer(lock_path: &Path) -> Result<WriterState> {
    let file = match OpenOptions::new().read(true).write(true).open(lock_path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(WriterState::Idle),
        Err(err) => {
            return Err(StorageError::io(
                format!("failed to open lock file {}", lock_path.display()),
                err,
            ));
        }
    };

    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            Ok(WriterState::Idle)
        }
        Err(err) if is_contended(&err) => Ok(WriterState::Running {
            pid: read_pid(lock_path),
        }),
        Err(err) => Err(StorageError::io(
            format!("failed to check {}", lock_path.display()),
            err,
        )),
    }
}

fn write_pid(file: &mut File) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.set_len(0)?;
    file.write_all(std::process::id().to_string().as_bytes())?;
    file.flush()
}

fn read_pid(lock_path: &Path) -> Option<u32> {
    fs::read_to_string(lock_path).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn inspect_reports_running_while_lock_is_held() {
        let tmp = TempDir::new().expect("temp dir");
        let lock_path = tmp.path().join("sessions").join("s1.lock");

        let guard = match acquire_writer_lock(&lock_path).expect("acquire") {
            AcquireState::Acquired(guard) => guard,
            AcquireState::AlreadyHeld { .. } => panic!("expected acquired lock"),
        };
        assert_eq!(guard.pid(), std::process::id());

        match inspect_writer(&lock_path).expect("inspect running") {
            WriterState::Running { .. } => {}
            WriterState::Idle => panic!("expected running state while lock is held"),
        }

        drop(guard);

        assert_eq!(
            inspect_writer(&lock_path).expect("inspect stopped"),
            WriterState::Idle
        );
    }

    #[test]
    fn second_writer_sees_lock_held() {
        let tmp = TempDir::new().expect("temp dir");
        let lock_path = tmp.path().join("s1.lock");

        let _guard = acquire_writer_lock(&lock_path).expect("first");
        match acquire_writer_lock(&lock_path).expect("second") {
            AcquireState::AlreadyHeld { .. } => {}
            AcquireState::Acquired(_) => panic!("second writer must not acquire"),
        }
    }

    #[test]
    fn missing_lock_file_means_idle() {
        let tmp = TempDir::new().expect("temp dir");
        let state = inspect_writer(&tmp.path().join("absent.lock")).expect("inspect");
        assert!(!state.is_running());
    }
}
