//! Session and metric storage.
//!
//! [`MetricsStore`] is the persistence boundary of the supervisor: a session is
//! opened when a run starts, periodic snapshots are saved against it and it is
//! closed at teardown. Two implementations are provided:
//!
//! - [`MemoryStore`]: mutex-guarded in-process tables
//! - [`JsonlStore`]: the same tables backed by an append-only JSON-lines journal
//!   that is replayed on open

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::stats::{infestation_ratio, PersistRequest};

pub type SessionId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub source: String,
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub id: u64,
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub unique_bees: u64,
    pub unique_varroa: u64,
    pub infestation_ratio: f64,
    pub frame_count: u64,
    pub fps: f64,
}

/// Persistence collaborator used by the supervisor and the HTTP layer.
pub trait MetricsStore: Send + Sync {
    fn start_session(&self, source: &str, notes: &str) -> Result<SessionId, StoreError>;

    /// Closing an unknown or already closed session is a no-op.
    fn end_session(&self, id: SessionId) -> Result<(), StoreError>;

    fn save_metrics(&self, id: SessionId, sample: PersistRequest) -> Result<(), StoreError>;

    /// Most recent sessions first.
    fn sessions(&self, limit: usize) -> Vec<SessionRecord>;

    /// Most recent metrics first, optionally for one session.
    fn latest_metrics(&self, limit: usize, session: Option<SessionId>) -> Vec<MetricsRecord>;
}

/// One journal line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JournalEntry {
    SessionStarted(SessionRecord),
    SessionEnded {
        id: SessionId,
        end_time: DateTime<Utc>,
    },
    Metrics(MetricsRecord),
}

#[derive(Debug, Default)]
struct Tables {
    sessions: Vec<SessionRecord>,
    metrics: VecDeque<MetricsRecord>,
    next_session_id: SessionId,
    next_metric_id: u64,
}

impl Tables {
    fn apply(&mut self, entry: JournalEntry, max_metrics: usize) {
        match entry {
            JournalEntry::SessionStarted(session) => {
                self.next_session_id = self.next_session_id.max(session.id);
                self.sessions.push(session);
            }
            JournalEntry::SessionEnded { id, end_time } => {
                if let Some(session) = self.sessions.iter_mut().find(|s| s.id == id) {
                    session.end_time.get_or_insert(end_time);
                }
            }
            JournalEntry::Metrics(record) => {
                self.next_metric_id = self.next_metric_id.max(record.id);
                self.metrics.push_back(record);
                while self.metrics.len() > max_metrics {
                    self.metrics.pop_front();
                }
            }
        }
    }
}

/// In-memory store. Metric retention is capped.
#[derive(Debug)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    max_metrics: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl MemoryStore {
    pub fn new(max_metrics: usize) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            max_metrics: max_metrics.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn replay(&self, entry: JournalEntry) {
        self.lock().apply(entry, self.max_metrics);
    }

    fn open_session(&self, source: &str, notes: &str) -> SessionRecord {
        let mut tables = self.lock();
        tables.next_session_id += 1;
        let record = SessionRecord {
            id: tables.next_session_id,
            start_time: Utc::now(),
            end_time: None,
            source: source.to_string(),
            notes: notes.to_string(),
        };
        tables.sessions.push(record.clone());
        record
    }

    /// Returns the end time when the session was open.
    fn close_session(&self, id: SessionId) -> Option<DateTime<Utc>> {
        let mut tables = self.lock();
        let session = tables
            .sessions
            .iter_mut()
            .find(|s| s.id == id && s.end_time.is_none())?;
        let now = Utc::now();
        session.end_time = Some(now);
        Some(now)
    }

    fn record_metrics(
        &self,
        id: SessionId,
        sample: PersistRequest,
    ) -> Result<MetricsRecord, StoreError> {
        let mut tables = self.lock();
        if !tables.sessions.iter().any(|s| s.id == id) {
            return Err(StoreError::UnknownSession(id));
        }
        tables.next_metric_id += 1;
        let record = MetricsRecord {
            id: tables.next_metric_id,
            session_id: id,
            timestamp: Utc::now(),
            unique_bees: sample.unique_bees,
            unique_varroa: sample.unique_varroa,
            infestation_ratio: infestation_ratio(sample.unique_bees, sample.unique_varroa),
            frame_count: sample.frame_count,
            fps: sample.fps,
        };
        tables.apply(JournalEntry::Metrics(record.clone()), self.max_metrics);
        Ok(record)
    }
}

impl MetricsStore for MemoryStore {
    fn start_session(&self, source: &str, notes: &str) -> Result<SessionId, StoreError> {
        let record = self.open_session(source, notes);
        debug!("Started session {} (source: {})", record.id, record.source);
        Ok(record.id)
    }

    fn end_session(&self, id: SessionId) -> Result<(), StoreError> {
        if self.close_session(id).is_some() {
            debug!("Ended session {}", id);
        }
        Ok(())
    }

    fn save_metrics(&self, id: SessionId, sample: PersistRequest) -> Result<(), StoreError> {
        self.record_metrics(id, sample).map(|_| ())
    }

    fn sessions(&self, limit: usize) -> Vec<SessionRecord> {
        self.lock().sessions.iter().rev().take(limit).cloned().collect()
    }

    fn latest_metrics(&self, limit: usize, session: Option<SessionId>) -> Vec<MetricsRecord> {
        self.lock()
            .metrics
            .iter()
            .rev()
            .filter(|m| session.map_or(true, |id| m.session_id == id))
            .take(limit)
            .cloned()
            .collect()
    }
}

/// [`MemoryStore`] with a JSON-lines journal.
///
/// The in-memory tables are updated before the journal line is written, so a
/// failed append is reported but the record stays visible until restart.
pub struct JsonlStore {
    memory: MemoryStore,
    path: PathBuf,
    journal: Mutex<File>,
}

impl JsonlStore {
    /// Opens (or creates) the journal at `path` and replays it.
    ///
    /// Lines that fail to parse are skipped with a warning.
    pub fn open(path: impl AsRef<Path>, max_metrics: usize) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let memory = MemoryStore::new(max_metrics);

        let mut torn_tail = false;
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            let mut replayed = 0usize;
            for (line_num, line) in reader.lines().enumerate() {
                let line = line?;
                torn_tail = false;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JournalEntry>(&line) {
                    Ok(entry) => {
                        memory.replay(entry);
                        replayed += 1;
                    }
                    Err(e) => {
                        torn_tail = true;
                        warn!(
                            "Skipping malformed journal line {} in {}: {}",
                            line_num + 1,
                            path.display(),
                            e
                        );
                    }
                }
            }
            info!("Replayed {} journal entries from {}", replayed, path.display());
        }

        let mut journal = OpenOptions::new().create(true).append(true).open(&path)?;
        if torn_tail {
            // Terminate the partial line so the next entry starts clean
            writeln!(journal)?;
        }
        Ok(Self {
            memory,
            path,
            journal: Mutex::new(journal),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, entry: &JournalEntry) -> Result<(), StoreError> {
        let line = serde_json::to_string(entry)?;
        let mut file = self.journal.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(file, "{}", line)?;
        file.flush()?;
        Ok(())
    }
}

impl MetricsStore for JsonlStore {
    fn start_session(&self, source: &str, notes: &str) -> Result<SessionId, StoreError> {
        let record = self.memory.open_session(source, notes);
        let id = record.id;
        self.append(&JournalEntry::SessionStarted(record))?;
        debug!("Started session {} in {}", id, self.path.display());
        Ok(id)
    }

    fn end_session(&self, id: SessionId) -> Result<(), StoreError> {
        match self.memory.close_session(id) {
            Some(end_time) => self.append(&JournalEntry::SessionEnded { id, end_time }),
            None => Ok(()),
        }
    }

    fn save_metrics(&self, id: SessionId, sample: PersistRequest) -> Result<(), StoreError> {
        let record = self.memory.record_metrics(id, sample)?;
        self.append(&JournalEntry::Metrics(record))
    }

    fn sessions(&self, limit: usize) -> Vec<SessionRecord> {
        self.memory.sessions(limit)
    }

    fn latest_metrics(&self, limit: usize, session: Option<SessionId>) -> Vec<MetricsRecord> {
        self.memory.latest_metrics(limit, session)
    }
}
