//! Append-only JSON Lines session log.
//!
//! Each line is one [`LogRecord`]. A record is durable once `append` returns.
//! A trailing line without its newline is a torn write from a crashed
//! appender: readers stop there, and the next writer truncates it away.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{IoResultExt, Result, StorageError};
use crate::model::{Event, IndexEntry, Platform, SessionTotals, Severity, SmellOccurrence};

const TAIL_SCAN_CHUNK: u64 = 4096;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogRecord {
    SessionStart {
        platform: Platform,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project: Option<String>,
        started_at: DateTime<Utc>,
    },
    Event(Event),
    SessionEnd {
        ended_at: DateTime<Utc>,
    },
}

/// Backing file of a [`SessionLog`].
pub trait LogFile: Write {
    fn sync(&mut self) -> io::Result<()>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl LogFile for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Write side of one session's log. Only the session's current writer holds one.
#[derive(Debug)]
pub struct SessionLog<F = File> {
    file: F,
    path: PathBuf,
    len: u64,
}

impl SessionLog {
    /// Opens (creating if needed) the log for appending, dropping any torn tail.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .io_context(|| format!("failed to create session directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .io_context(|| format!("failed to open session log {}", path.display()))?;

        let len = file
            .metadata()
            .io_context(|| format!("failed to stat session log {}", path.display()))?
            .len();
        let complete = complete_prefix_len(&mut file, len)
            .io_context(|| format!("failed to scan session log {}", path.display()))?;
        if complete < len {
            warn!(
                path = %path.display(),
                dropped_bytes = len - complete,
                "truncating torn record at end of session log"
            );
            file.set_len(complete)
                .io_context(|| format!("failed to repair session log {}", path.display()))?;
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            len: complete,
        })
    }

}

impl<F: LogFile> SessionLog<F> {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Writes one record and syncs it. On failure the partial line is cut off
    /// again so the log never keeps half a record.
    pub fn append(&mut self, record: &LogRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let offset = self.len;
        let written = self
            .file
            .write_all(&line)
            .and_then(|()| self.file.sync());
        if let Err(err) = written {
            if let Err(rollback) = self.file.truncate(offset) {
                warn!(
                    path = %self.path.display(),
                    error = %rollback,
                    "failed to roll back partial append"
                );
            }
            return Err(StorageError::io(
                format!("failed to append to {}", self.path.display()),
                err,
            ));
        }

        self.len += line.len() as u64;
        Ok(())
    }
}

fn complete_prefix_len(file: &mut File, len: u64) -> io::Result<u64> {
    let mut end = len;
    let mut buf = vec![0_u8; TAIL_SCAN_CHUNK as usize];
    while end > 0 {
        let start = end.saturating_sub(TAIL_SCAN_CHUNK);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        if let Some(pos) = chunk.iter().rposition(|byte| *byte == b'\n') {
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}

/// Lazy reader over every record in a log, in append order.
///
/// Malformed complete lines are skipped; a torn final line ends the stream.
#[derive(Debug)]
pub struct LogRecords {
    path: PathBuf,
    reader: BufReader<File>,
    line: Vec<u8>,
    line_no: u64,
    done: bool,
}

impl LogRecords {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::NotFound(session_name(path))
            } else {
                StorageError::io(format!("failed to open session log {}", path.display()), err)
            }
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            line: Vec::new(),
            line_no: 0,
            done: false,
        })
    }

    /// Restarts the sequence from the first record.
    pub fn rewind(&mut self) -> Result<()> {
        self.reader
            .seek(SeekFrom::Start(0))
            .io_context(|| format!("failed to rewind session log {}", self.path.display()))?;
        self.line_no = 0;
        self.done = false;
        Ok(())
    }
}

impl Iterator for LogRecords {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            self.line.clear();
            match self.reader.read_until(b'\n', &mut self.line) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {
                    self.line_no += 1;
                    if self.line.last() != Some(&b'\n') {
                        warn!(
                            path = %self.path.display(),
                            line = self.line_no,
                            "ignoring torn record at end of session log"
                        );
                        self.done = true;
                        return None;
                    }
                    if self.line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    match serde_json::from_slice::<LogRecord>(&self.line) {
                        Ok(record) => return Some(Ok(record)),
                        Err(err) => {
                            warn!(
                                path = %self.path.display(),
                                line = self.line_no,
                                error = %err,
                                "skipping malformed session log line"
                            );
                        }
                    }
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(StorageError::io(
                        format!("failed to read session log {}", self.path.display()),
                        err,
                    )));
                }
            }
        }
    }
}

/// Events only, skipping start/end markers.
#[derive(Debug)]
pub struct SessionEvents {
    records: LogRecords,
}

impl SessionEvents {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            records: LogRecords::open(path)?,
        })
    }

    pub fn rewind(&mut self) -> Result<()> {
        self.records.rewind()
    }
}

impl Iterator for SessionEvents {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        for record in self.records.by_ref() {
            match record {
                Ok(LogRecord::Event(event)) => return Some(Ok(event)),
                Ok(_) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
        None
    }
}

#[derive(Debug, Clone)]
struct StartInfo {
    platform: Platform,
    project: Option<String>,
    started_at: DateTime<Utc>,
}

/// Folds log records into the running summary mirrored into the index.
#[derive(Debug, Clone, Default)]
pub struct SessionAccumulator {
    start: Option<StartInfo>,
    last_seen: Option<DateTime<Utc>>,
    totals: SessionTotals,
    smells: BTreeMap<(String, String), (Severity, u64)>,
    models: BTreeMap<String, u64>,
    ended: bool,
}

impl SessionAccumulator {
    /// Replays a whole log. A missing log yields `NotFound`.
    pub fn replay(path: &Path) -> Result<Self> {
        let mut accumulator = Self::default();
        for record in LogRecords::open(path)? {
            accumulator.apply(&record?);
        }
        debug!(
            path = %path.display(),
            events = accumulator.totals.events,
            "replayed session log"
        );
        Ok(accumulator)
    }

    pub fn apply(&mut self, record: &LogRecord) {
        match record {
            LogRecord::SessionStart {
                platform,
                project,
                started_at,
            } => {
                if self.start.is_none() {
                    self.start = Some(StartInfo {
                        platform: *platform,
                        project: project.clone(),
                        started_at: *started_at,
                    });
                }
                self.ended = false;
                self.observe(*started_at);
            }
            LogRecord::Event(event) => {
                self.totals.tokens = self.totals.tokens.saturating_add(event.tokens);
                self.totals.cost_usd += event.cost_usd.unwrap_or(0.0);
                self.totals.events += 1;
                if let Some(model) = event.model.as_deref().map(str::trim)
                    && !model.is_empty()
                {
                    *self.models.entry(model.to_string()).or_insert(0) += event.tokens;
                }
                for smell in &event.smells {
                    let slot = self
                        .smells
                        .entry((smell.pattern.clone(), event.tool.clone()))
                        .or_insert((smell.severity, 0));
                    slot.0 = slot.0.max(smell.severity);
                    slot.1 += 1;
                }
                self.observe(event.timestamp);
            }
            LogRecord::SessionEnd { ended_at } => {
                self.ended = true;
                self.observe(*ended_at);
            }
        }
    }

    fn observe(&mut self, at: DateTime<Utc>) {
        self.last_seen = Some(self.last_seen.map_or(at, |seen| seen.max(at)));
    }

    pub fn has_start(&self) -> bool {
        self.start.is_some()
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn totals(&self) -> SessionTotals {
        self.totals
    }

    /// `None` until a `session_start` record has been applied.
    pub fn to_entry(&self, session_id: &str, active: bool) -> Option<IndexEntry> {
        let start = self.start.as_ref()?;
        let smells = self
            .smells
            .iter()
            .map(|((pattern, tool), (severity, count))| SmellOccurrence {
                pattern: pattern.clone(),
                tool: tool.clone(),
                severity: *severity,
                count: *count,
            })
            .collect();
        Some(IndexEntry {
            session_id: session_id.to_string(),
            platform: start.platform,
            project: start.project.clone(),
            started_at: start.started_at,
            updated_at: self.last_seen.unwrap_or(start.started_at),
            totals: self.totals,
            active,
            smells,
            models: self.models.clone(),
        })
    }
}

fn session_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Smell;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 10, minute, 0).unwrap()
    }

    fn start(project: Option<&str>, minute: u32) -> LogRecord {
        LogRecord::SessionStart {
            platform: Platform::ClaudeCode,
            project: project.map(ToString::to_string),
            started_at: ts(minute),
        }
    }

    fn write_records(path: &Path, records: &[LogRecord]) {
        let mut log = SessionLog::open(path).expect("open log");
        for record in records {
            log.append(record).expect("append");
        }
    }

    #[test]
    fn records_read_back_in_append_order() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("sessions").join("s1.jsonl");
        write_records(
            &path,
            &[
                start(Some("api"), 0),
                LogRecord::Event(Event::new("Read", 100).at(ts(1))),
                LogRecord::Event(Event::new("Edit", 200).at(ts(2))),
            ],
        );

        let tools: Vec<String> = SessionEvents::open(&path)
            .expect("open events")
            .map(|event| event.expect("event").tool)
            .collect();
        assert_eq!(tools, vec!["Read", "Edit"]);
    }

    #[test]
    fn wire_format_is_tagged_by_type() {
        let line = serde_json::to_string(&LogRecord::SessionEnd { ended_at: ts(5) }).expect("encode");
        assert!(line.starts_with(r#"{"type":"session_end""#), "{line}");
    }

    #[test]
    fn torn_trailing_record_ends_stream() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("s1.jsonl");
        write_records(
            &path,
            &[start(None, 0), LogRecord::Event(Event::new("Read", 10).at(ts(1)))],
        );
        let mut raw = OpenOptions::new().append(true).open(&path).expect("raw");
        raw.write_all(br#"{"type":"event","timestamp":"2025-06"#)
            .expect("torn write");

        let events: Vec<Event> = SessionEvents::open(&path)
            .expect("open")
            .collect::<Result<_>>()
            .expect("no error for torn tail");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn malformed_middle_line_is_skipped() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("s1.jsonl");
        let event = serde_json::to_string(&LogRecord::Event(Event::new("Bash", 5).at(ts(2))))
            .expect("encode");
        fs::write(&path, format!("not json\n\n{event}\n")).expect("write");

        let events: Vec<Event> = SessionEvents::open(&path)
            .expect("open")
            .collect::<Result<_>>()
            .expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tool, "Bash");
    }

    #[test]
    fn rewind_restarts_sequence() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("s1.jsonl");
        write_records(
            &path,
            &[start(None, 0), LogRecord::Event(Event::new("Read", 1).at(ts(1)))],
        );

        let mut events = SessionEvents::open(&path).expect("open");
        assert_eq!(events.by_ref().count(), 1);
        assert!(events.next().is_none());
        events.rewind().expect("rewind");
        assert_eq!(events.count(), 1);
    }

    #[test]
    fn reopening_repairs_torn_tail_before_appending() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("s1.jsonl");
        write_records(&path, &[start(None, 0)]);
        let intact_len = fs::metadata(&path).expect("meta").len();
        let mut raw = OpenOptions::new().append(true).open(&path).expect("raw");
        raw.write_all(b"{\"type\":\"ev").expect("torn write");

        let mut log = SessionLog::open(&path).expect("reopen");
        assert_eq!(log.len(), intact_len);
        log.append(&LogRecord::Event(Event::new("Write", 7).at(ts(3))))
            .expect("append after repair");

        let records: Vec<LogRecord> = LogRecords::open(&path)
            .expect("open")
            .collect::<Result<_>>()
            .expect("records");
        assert_eq!(records.len(), 2);
    }

    /// Fails the first write after persisting `fail_after` bytes of it.
    struct FailingFile {
        file: File,
        fail_after: Option<usize>,
    }

    impl Write for FailingFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.fail_after.take() {
                Some(limit) => {
                    self.file.write_all(&buf[..limit.min(buf.len())])?;
                    Err(io::Error::other("disk full"))
                }
                None => self.file.write(buf),
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            self.file.flush()
        }
    }

    impl LogFile for FailingFile {
        fn sync(&mut self) -> io::Result<()> {
            self.file.sync_data()
        }

        fn truncate(&mut self, len: u64) -> io::Result<()> {
            self.file.set_len(len)
        }
    }

    #[test]
    fn failed_append_rolls_back_partial_line() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("s1.jsonl");
        write_records(&path, &[start(None, 0)]);
        let intact_len = fs::metadata(&path).expect("meta").len();

        let file = OpenOptions::new().append(true).open(&path).expect("open");
        let mut log = SessionLog {
            file: FailingFile {
                file,
                fail_after: Some(5),
            },
            path: path.clone(),
            len: intact_len,
        };

        let err = log
            .append(&LogRecord::Event(Event::new("Read", 10).at(ts(1))))
            .expect_err("write fails");
        assert!(matches!(err, StorageError::Io { .. }));
        assert_eq!(log.len(), intact_len);
        assert_eq!(fs::metadata(&path).expect("meta").len(), intact_len);

        log.append(&LogRecord::Event(Event::new("Write", 7).at(ts(2))))
            .expect("next append succeeds");
        let events: Vec<Event> = SessionEvents::open(&path)
            .expect("open")
            .collect::<Result<_>>()
            .expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tool, "Write");
    }

    #[test]
    fn missing_log_is_not_found() {
        let tmp = TempDir::new().expect("temp dir");
        let err = LogRecords::open(&tmp.path().join("ghost.jsonl")).expect_err("missing");
        assert!(matches!(err, StorageError::NotFound(ref id) if id == "ghost"));
    }

    #[test]
    fn accumulator_sums_totals_and_smells() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("s1.jsonl");
        write_records(
            &path,
            &[
                start(Some("api"), 0),
                LogRecord::Event(
                    Event::new("mcp__zen__chat", 1000)
                        .with_cost(0.01)
                        .with_smell(Smell::new("DUPLICATE_CALLS", Severity::Low))
                        .at(ts(1)),
                ),
                LogRecord::Event(
                    Event::new("mcp__zen__chat", 500)
                        .with_smell(Smell::new("DUPLICATE_CALLS", Severity::High))
                        .at(ts(4)),
                ),
                LogRecord::SessionEnd { ended_at: ts(6) },
                start(Some("other"), 30),
            ],
        );

        let accumulator = SessionAccumulator::replay(&path).expect("replay");
        let entry = accumulator.to_entry("s1", false).expect("entry");
        assert_eq!(entry.totals.tokens, 1500);
        assert_eq!(entry.totals.events, 2);
        assert!((entry.totals.cost_usd - 0.01).abs() < 1e-9);
        assert_eq!(entry.project.as_deref(), Some("api"));
        assert_eq!(entry.started_at, ts(0));
        assert_eq!(entry.updated_at, ts(30));
        assert_eq!(entry.smells.len(), 1);
        assert_eq!(entry.smells[0].count, 2);
        assert_eq!(entry.smells[0].severity, Severity::High);
        assert!(!accumulator.is_ended(), "reopen after end clears the flag");
    }

    #[test]
    fn accumulator_without_start_has_no_entry() {
        let mut accumulator = SessionAccumulator::default();
        accumulator.apply(&LogRecord::Event(Event::new("Read", 1)));
        assert!(!accumulator.has_start());
        assert!(accumulator.to_entry("s1", false).is_none());
    }
}
