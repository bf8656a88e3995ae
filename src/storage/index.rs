//! Shared session index: a JSON catalog of [`IndexEntry`] summaries.
//!
//! Reads take no lock; they rely on writers replacing the file with an atomic
//! rename. Every read-modify-write runs under the index lock. The index is a
//! cache over the session logs, so an unreadable file is treated as empty.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{IoResultExt, Result, StorageError};
use crate::filter::SessionFilter;
use crate::model::IndexEntry;
use crate::storage::index_lock::with_index_lock;

pub const INDEX_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexFile {
    pub schema_version: u32,
    pub updated_at: Option<DateTime<Utc>>,
    pub sessions: BTreeMap<String, IndexEntry>,
}

impl Default for IndexFile {
    fn default() -> Self {
        Self {
            schema_version: INDEX_SCHEMA_VERSION,
            updated_at: None,
            sessions: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Loaded,
    Missing,
    Corrupt,
}

#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    pub file: IndexFile,
    pub state: IndexState,
}

#[derive(Debug, Clone)]
pub struct SessionIndex {
    path: PathBuf,
    lock_timeout: Duration,
}

impl SessionIndex {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Lock-free read of the last fully written index.
    pub fn snapshot(&self) -> Result<IndexSnapshot> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(IndexSnapshot {
                    file: IndexFile::default(),
                    state: IndexState::Missing,
                });
            }
            Err(err) => {
                return Err(StorageError::io(
                    format!("failed to read index {}", self.path.display()),
                    err,
                ));
            }
        };

        match serde_json::from_slice::<IndexFile>(&raw) {
            Ok(file) => Ok(IndexSnapshot {
                file,
                state: IndexState::Loaded,
            }),
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "session index is unreadable; treating it as empty"
                );
                Ok(IndexSnapshot {
                    file: IndexFile::default(),
                    state: IndexState::Corrupt,
                })
            }
        }
    }

    /// Reload, mutate and atomically rewrite the index while holding the
    /// index lock. Nothing is written if `mutate` fails.
    pub fn update<T>(&self, mutate: impl FnOnce(&mut IndexFile) -> Result<T>) -> Result<T> {
        with_index_lock(&self.path, self.lock_timeout, || {
            let mut file = self.snapshot()?.file;
            let outcome = mutate(&mut file)?;
            file.schema_version = INDEX_SCHEMA_VERSION;
            file.updated_at = Some(Utc::now());
            self.write(&file)?;
            debug!(
                path = %self.path.display(),
                sessions = file.sessions.len(),
                "session index rewritten"
            );
            Ok(outcome)
        })
    }

    /// Last writer wins.
    pub fn upsert(&self, entry: IndexEntry) -> Result<()> {
        self.update(|file| {
            file.sessions.insert(entry.session_id.clone(), entry);
            Ok(())
        })
    }

    /// Returns whether an entry was present. Removing an absent id is not an error.
    pub fn remove(&self, session_id: &str) -> Result<bool> {
        self.update(|file| Ok(file.sessions.remove(session_id).is_some()))
    }

    pub fn get(&self, session_id: &str) -> Result<Option<IndexEntry>> {
        Ok(self.snapshot()?.file.sessions.remove(session_id))
    }

    pub fn list(&self, filter: &SessionFilter) -> Result<Vec<IndexEntry>> {
        let snapshot = self.snapshot()?;
        Ok(filter.select(snapshot.file.sessions.into_values()))
    }

    fn write(&self, file: &IndexFile) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)
            .io_context(|| format!("failed to create index directory {}", dir.display()))?;

        let tmp = NamedTempFile::new_in(dir)
            .io_context(|| format!("failed to create temp index in {}", dir.display()))?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, file)?;
            writer
                .flush()
                .io_context(|| format!("failed to write index {}", self.path.display()))?;
        }
        tmp.as_file()
            .sync_all()
            .io_context(|| format!("failed to sync index {}", self.path.display()))?;
        tmp.persist(&self.path).map_err(|err| {
            StorageError::io(
                format!("failed to replace index {}", self.path.display()),
                err.error,
            )
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Platform, SessionTotals};
    use std::thread;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(5);

    fn entry(id: &str, tokens: u64) -> IndexEntry {
        IndexEntry {
            session_id: id.to_string(),
            platform: Platform::CodexCli,
            project: None,
            started_at: Utc::now(),
            updated_at: Utc::now(),
            totals: SessionTotals {
                tokens,
                cost_usd: 0.0,
                events: 1,
            },
            active: false,
            smells: Vec::new(),
            models: BTreeMap::new(),
        }
    }

    #[test]
    fn missing_index_is_empty() {
        let tmp = TempDir::new().expect("temp dir");
        let index = SessionIndex::new(tmp.path().join("index.json"), WAIT);
        let snapshot = index.snapshot().expect("snapshot");
        assert_eq!(snapshot.state, IndexState::Missing);
        assert!(snapshot.file.sessions.is_empty());
    }

    #[test]
    fn corrupt_index_is_treated_as_empty() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("index.json");
        fs::write(&path, "{\"sessions\": {\"s1\": ").expect("write corrupt");

        let index = SessionIndex::new(&path, WAIT);
        let snapshot = index.snapshot().expect("snapshot");
        assert_eq!(snapshot.state, IndexState::Corrupt);
        assert!(index.list(&SessionFilter::default()).expect("list").is_empty());

        index.upsert(entry("s2", 10)).expect("upsert over corrupt file");
        assert_eq!(index.snapshot().expect("reload").state, IndexState::Loaded);
    }

    #[test]
    fn non_utf8_index_is_treated_as_empty() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("index.json");
        fs::write(&path, [0xff, 0xfe, 0x00, 0x7b]).expect("write garbage");

        let index = SessionIndex::new(&path, WAIT);
        assert_eq!(index.snapshot().expect("snapshot").state, IndexState::Corrupt);
        assert!(index.list(&SessionFilter::default()).expect("list").is_empty());

        index.upsert(entry("s1", 10)).expect("upsert over garbage");
        let reloaded = index.snapshot().expect("reload");
        assert_eq!(reloaded.state, IndexState::Loaded);
        assert!(reloaded.file.sessions.contains_key("s1"));
    }

    #[test]
    fn upsert_replaces_and_remove_is_idempotent() {
        let tmp = TempDir::new().expect("temp dir");
        let index = SessionIndex::new(tmp.path().join("index.json"), WAIT);

        index.upsert(entry("s1", 10)).expect("insert");
        index.upsert(entry("s1", 25)).expect("replace");
        assert_eq!(index.get("s1").expect("get").map(|e| e.totals.tokens), Some(25));

        assert!(index.remove("s1").expect("remove"));
        assert!(!index.remove("s1").expect("remove again"));
        assert!(index.get("s1").expect("get").is_none());
    }

    #[test]
    fn failed_mutation_leaves_file_untouched() {
        let tmp = TempDir::new().expect("temp dir");
        let index = SessionIndex::new(tmp.path().join("index.json"), WAIT);
        index.upsert(entry("s1", 10)).expect("insert");
        let before = fs::read_to_string(index.path()).expect("read");

        let result: Result<()> = index.update(|file| {
            file.sessions.clear();
            Err(StorageError::NotFound("s1".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(fs::read_to_string(index.path()).expect("read"), before);
    }

    #[test]
    fn concurrent_upserts_lose_no_entries() {
        let tmp = TempDir::new().expect("temp dir");
        let index = SessionIndex::new(tmp.path().join("index.json"), WAIT);

        let workers: Vec<_> = (0..8)
            .map(|n| {
                let index = index.clone();
                thread::spawn(move || index.upsert(entry(&format!("s{n}"), n)))
            })
            .collect();
        for worker in workers {
            worker.join().expect("join").expect("upsert");
        }

        let snapshot = index.snapshot().expect("snapshot");
        assert_eq!(snapshot.file.sessions.len(), 8);
        assert!(snapshot.file.updated_at.is_some());
    }

    #[test]
    fn rewrite_leaves_no_temp_files() {
        let tmp = TempDir::new().expect("temp dir");
        let index = SessionIndex::new(tmp.path().join("index.json"), WAIT);
        for n in 0..3 {
            index.upsert(entry(&format!("s{n}"), n)).expect("upsert");
        }

        let mut names: Vec<String> = fs::read_dir(tmp.path())
            .expect("read dir")
            .map(|item| item.expect("dir entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["index.json", "index.json.lock"]);
    }
}
