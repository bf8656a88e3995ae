//! Concurrent session storage engine.
//!
//! Layout under the base directory:
//!
//! ```text
//! index.json            shared session index
//! index.json.lock       cross-process index lock
//! sessions/<id>.jsonl   append-only session log
//! sessions/<id>.lock    writer liveness lock
//! ```
//!
//! Lock order is always session lock, then writer lock, then index lock.
//! Code holding the index lock only ever *try-locks* writer locks.

pub mod index;
pub mod index_lock;
pub mod lock_table;
pub mod log;
pub mod writer_guard;

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::PricingConfig;
use crate::cost::estimate_cost;
use crate::error::{IoResultExt, Result, StorageError};
use crate::filter::SessionFilter;
use crate::model::{Event, IndexEntry, Platform, SessionTotals, normalize_project};

pub use index::{IndexFile, IndexSnapshot, IndexState, SessionIndex};
pub use index_lock::{IndexLockGuard, acquire_index_lock, with_index_lock};
pub use lock_table::{SessionLock, SessionLockGuard, SessionLockTable};
pub use log::{LogFile, LogRecord, LogRecords, SessionAccumulator, SessionEvents, SessionLog};
pub use writer_guard::{AcquireState, WriterGuard, WriterState, acquire_writer_lock, inspect_writer};

const INDEX_FILE: &str = "index.json";
const SESSIONS_DIR: &str = "sessions";
const LOG_EXTENSION: &str = "jsonl";
const WRITER_LOCK_EXTENSION: &str = "lock";
const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Upper bound for every session-lock and index-lock wait.
    pub lock_timeout: Duration,
    pub index_flush_every: u64,
    pub pricing: PricingConfig,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            index_flush_every: 10,
            pricing: PricingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyAbsent,
}

/// Entry point shared by the recorder (writer) and browser (reader) roles.
#[derive(Debug)]
pub struct SessionStorage {
    base_dir: PathBuf,
    sessions_dir: PathBuf,
    index: SessionIndex,
    locks: SessionLockTable,
    options: StorageOptions,
}

impl SessionStorage {
    pub fn open(base_dir: impl Into<PathBuf>, options: StorageOptions) -> Result<Self> {
        let base_dir = base_dir.into();
        let sessions_dir = base_dir.join(SESSIONS_DIR);
        fs::create_dir_all(&sessions_dir).io_context(|| {
            format!("failed to create sessions directory {}", sessions_dir.display())
        })?;
        let index = SessionIndex::new(base_dir.join(INDEX_FILE), options.lock_timeout);
        Ok(Self {
            base_dir,
            sessions_dir,
            index,
            locks: SessionLockTable::new(),
            options,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    pub fn index(&self) -> &SessionIndex {
        &self.index
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    pub fn lock_for(&self, session_id: &str) -> Arc<SessionLock> {
        self.locks.lock_for(session_id)
    }

    pub fn log_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir
            .join(format!("{session_id}.{LOG_EXTENSION}"))
    }

    fn writer_lock_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir
            .join(format!("{session_id}.{WRITER_LOCK_EXTENSION}"))
    }

    /// Claims the session for this writer, creating the log if needed.
    pub fn open_for_writing(
        &self,
        session_id: &str,
        platform: Platform,
        project: Option<&str>,
    ) -> Result<SessionWriter> {
        validate_session_id(session_id)?;
        let lock = self.locks.lock_for(session_id);
        let session_guard = lock.acquire(self.options.lock_timeout)?;

        let writer_lock = match acquire_writer_lock(&self.writer_lock_path(session_id))? {
            AcquireState::Acquired(guard) => guard,
            AcquireState::AlreadyHeld { pid } => {
                debug!(session_id, ?pid, "session already has a writer");
                return Err(StorageError::AlreadyActive(session_id.to_string()));
            }
        };

        let log_path = self.log_path(session_id);
        let mut accumulator = match SessionAccumulator::replay(&log_path) {
            Ok(accumulator) => accumulator,
            Err(StorageError::NotFound(_)) => SessionAccumulator::default(),
            Err(err) => return Err(err),
        };
        let resumed = accumulator.has_start();

        let start = LogRecord::SessionStart {
            platform,
            project: normalize_project(project),
            started_at: Utc::now(),
        };
        accumulator.apply(&start);

        // Index first: a timeout here leaves the log untouched.
        if let Some(entry) = accumulator.to_entry(session_id, true) {
            self.index.upsert(entry)?;
        }
        let mut log = SessionLog::open(&log_path)?;
        log.append(&start)?;

        info!(
            session_id,
            platform = %platform,
            resumed,
            "session opened for writing"
        );
        drop(session_guard);

        Ok(SessionWriter {
            session_id: session_id.to_string(),
            lock,
            lock_timeout: self.options.lock_timeout,
            index: self.index.clone(),
            log,
            accumulator,
            pricing: self.options.pricing.clone(),
            flush_every: self.options.index_flush_every.max(1),
            pending_mirror: 0,
            writer_lock: Some(writer_lock),
        })
    }

    /// Best-effort snapshot; destructive callers must re-check under lock.
    pub fn has_active_session(&self, session_id: &str) -> Result<bool> {
        validate_session_id(session_id)?;
        let lock = self.locks.lock_for(session_id);
        let _session = lock.acquire(self.options.lock_timeout)?;
        Ok(inspect_writer(&self.writer_lock_path(session_id))?.is_running())
    }

    /// Lock-free liveness check of the session's writer.
    pub fn writer_state(&self, session_id: &str) -> Result<WriterState> {
        inspect_writer(&self.writer_lock_path(session_id))
    }

    /// Removes an inactive session's log, then its index entry. Waits for an
    /// in-flight append on the session lock and fails with `SessionBusy` if
    /// a writer still owns the session.
    pub fn delete_session(&self, session_id: &str) -> Result<DeleteOutcome> {
        validate_session_id(session_id)?;
        let lock = self.locks.lock_for(session_id);
        let _session = lock.acquire(self.options.lock_timeout)?;

        let writer_guard = match acquire_writer_lock(&self.writer_lock_path(session_id))? {
            AcquireState::Acquired(guard) => guard,
            AcquireState::AlreadyHeld { .. } => {
                return Err(StorageError::SessionBusy(session_id.to_string()));
            }
        };

        let log_path = self.log_path(session_id);
        let removed = self.index.update(|file| {
            let log_removed = match fs::remove_file(&log_path) {
                Ok(()) => true,
                Err(err) if err.kind() == ErrorKind::NotFound => false,
                Err(err) => {
                    return Err(StorageError::io(
                        format!("failed to remove session log {}", log_path.display()),
                        err,
                    ));
                }
            };
            let entry_removed = file.sessions.remove(session_id).is_some();
            Ok(log_removed || entry_removed)
        })?;

        // Writer lock files are never unlinked: every writer must lock the same inode.
        drop(writer_guard);

        if removed {
            info!(session_id, "session deleted");
            Ok(DeleteOutcome::Deleted)
        } else {
            debug!(session_id, "session already absent");
            Ok(DeleteOutcome::AlreadyAbsent)
        }
    }

    /// Lazy, restartable sequence of the session's events.
    pub fn read(&self, session_id: &str) -> Result<SessionEvents> {
        validate_session_id(session_id)?;
        SessionEvents::open(&self.log_path(session_id))
    }

    /// Summary recomputed from the log itself rather than the index.
    pub fn summary(&self, session_id: &str) -> Result<IndexEntry> {
        validate_session_id(session_id)?;
        self.summarize(session_id)?
            .ok_or_else(|| StorageError::NotFound(session_id.to_string()))
    }

    /// Index listing, reconciled against the logs when the index is missing,
    /// corrupt or lacks a session that has a log.
    pub fn list(&self, filter: &SessionFilter) -> Result<Vec<IndexEntry>> {
        let snapshot = self.index.snapshot()?;
        let log_ids = self.log_ids()?;
        let stale = log_ids
            .iter()
            .any(|id| !snapshot.file.sessions.contains_key(id));

        let mut entries: Vec<IndexEntry> = if stale {
            debug!(state = ?snapshot.state, logs = log_ids.len(), "reconciling index with session logs");
            match self.rebuild_index() {
                Ok(_) => self.index.snapshot()?.file.sessions.into_values().collect(),
                Err(err) if err.is_retryable() => {
                    warn!(error = %err, "index busy; listing directly from session logs");
                    self.scan_logs()?
                }
                Err(err) => return Err(err),
            }
        } else {
            snapshot.file.sessions.into_values().collect()
        };

        for entry in &mut entries {
            entry.active = self.writer_state(&entry.session_id)?.is_running();
        }
        Ok(filter.select(entries))
    }

    /// Rewrites the whole index from the session logs. Returns the entry count.
    pub fn rebuild_index(&self) -> Result<usize> {
        let count = self.index.update(|file| {
            file.sessions = self
                .scan_logs()?
                .into_iter()
                .map(|entry| (entry.session_id.clone(), entry))
                .collect::<BTreeMap<_, _>>();
            Ok(file.sessions.len())
        })?;
        info!(sessions = count, "session index rebuilt from logs");
        Ok(count)
    }

    /// Marks entries whose writer died without finalizing as inactive.
    pub fn reap_stale(&self) -> Result<usize> {
        let reaped = self.index.update(|file| {
            let mut reaped = 0;
            for (session_id, entry) in file.sessions.iter_mut() {
                if !entry.active || self.writer_state(session_id)?.is_running() {
                    continue;
                }
                match self.summarize(session_id) {
                    Ok(Some(fresh)) => *entry = fresh,
                    Ok(None) | Err(StorageError::NotFound(_)) => {}
                    Err(err) => return Err(err),
                }
                entry.active = false;
                reaped += 1;
                warn!(session_id = %session_id, "writer exited without finalizing; marked inactive");
            }
            Ok(reaped)
        })?;
        Ok(reaped)
    }

    fn summarize(&self, session_id: &str) -> Result<Option<IndexEntry>> {
        let accumulator = SessionAccumulator::replay(&self.log_path(session_id))?;
        let active = self.writer_state(session_id)?.is_running();
        Ok(accumulator.to_entry(session_id, active))
    }

    fn scan_logs(&self) -> Result<Vec<IndexEntry>> {
        let mut entries = Vec::new();
        for session_id in self.log_ids()? {
            match self.summarize(&session_id) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => warn!(session_id = %session_id, "session log has no start record; skipped"),
                Err(StorageError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(entries)
    }

    fn log_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in WalkDir::new(&self.sessions_dir).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if err.io_error().map(|io| io.kind()) == Some(ErrorKind::NotFound) => {
                    continue;
                }
                Err(err) => {
                    let context = format!("failed to scan {}", self.sessions_dir.display());
                    return Err(match err.into_io_error() {
                        Some(source) => StorageError::io(context, source),
                        None => StorageError::io(context, std::io::Error::other("walk error")),
                    });
                }
            };
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|ext| ext.to_str()) != Some(LOG_EXTENSION)
            {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str())
                && validate_session_id(stem).is_ok()
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Session ids become file names, so they are restricted to a safe charset.
pub fn validate_session_id(session_id: &str) -> Result<()> {
    let valid = !session_id.is_empty()
        && session_id.len() <= MAX_SESSION_ID_LEN
        && !session_id.starts_with('.')
        && session_id
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidSessionId(session_id.to_string()))
    }
}

/// Exclusive write handle for one session. Dropping it finalizes the session.
#[derive(Debug)]
pub struct SessionWriter {
    session_id: String,
    lock: Arc<SessionLock>,
    lock_timeout: Duration,
    index: SessionIndex,
    log: SessionLog,
    accumulator: SessionAccumulator,
    pricing: PricingConfig,
    flush_every: u64,
    pending_mirror: u64,
    writer_lock: Option<WriterGuard>,
}

impl SessionWriter {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn totals(&self) -> SessionTotals {
        self.accumulator.totals()
    }

    pub fn is_finalized(&self) -> bool {
        self.writer_lock.is_none()
    }

    /// Durably appends one event. Index mirroring failures after a successful
    /// append are logged and retried on the next append; `finalize` reports them.
    pub fn append(&mut self, mut event: Event) -> Result<()> {
        if self.is_finalized() {
            return Err(StorageError::SessionClosed(self.session_id.clone()));
        }
        if event.cost_usd.is_none()
            && let Some(model) = event.model.as_deref()
        {
            event.cost_usd = Some(estimate_cost(model, event.tokens, &self.pricing).cost_usd);
        }

        let record = LogRecord::Event(event);
        {
            let lock = Arc::clone(&self.lock);
            let _session = lock.acquire(self.lock_timeout)?;
            self.log.append(&record)?;
        }
        self.accumulator.apply(&record);

        self.pending_mirror += 1;
        if self.pending_mirror >= self.flush_every {
            match self.mirror(true) {
                Ok(()) => self.pending_mirror = 0,
                Err(err) => warn!(
                    session_id = %self.session_id,
                    error = %err,
                    pending = self.pending_mirror,
                    "index mirror failed; will retry on next append"
                ),
            }
        }
        Ok(())
    }

    /// Writes the end marker, flushes totals into the index and releases
    /// ownership. Finalizing twice is a no-op.
    pub fn finalize(&mut self) -> Result<()> {
        if self.is_finalized() {
            return Ok(());
        }

        let lock = Arc::clone(&self.lock);
        let _session = lock.acquire(self.lock_timeout)?;
        if !self.accumulator.is_ended() {
            let end = LogRecord::SessionEnd {
                ended_at: Utc::now(),
            };
            self.log.append(&end)?;
            self.accumulator.apply(&end);
        }
        self.mirror(false)?;
        self.pending_mirror = 0;
        self.writer_lock = None;

        let totals = self.accumulator.totals();
        info!(
            session_id = %self.session_id,
            events = totals.events,
            tokens = totals.tokens,
            "session finalized"
        );
        Ok(())
    }

    fn mirror(&self, active: bool) -> Result<()> {
        match self.accumulator.to_entry(&self.session_id, active) {
            Some(entry) => self.index.upsert(entry),
            None => Ok(()),
        }
    }
}

impl Drop for SessionWriter {
    fn drop(&mut self) {
        if let Err(err) = self.finalize() {
            warn!(session_id = %self.session_id, error = %err, "failed to finalize session on drop");
        }
    }
}
