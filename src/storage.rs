//! Durable storage behind the persistent state: `currentTerm`, `votedFor` and the log.
//!
//! Every write must be on stable storage before the call returns; the consensus core only makes a
//! vote or an acknowledgement observable after the matching call has returned `Ok`.

use super::log::LogEntry;
use super::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("storage unavailable")]
    Unavailable,
}

pub trait Storage {
    /// Persist the current term and vote in a single durable write.
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<(), StorageError>;

    fn load_term_and_vote(&self) -> Result<(Term, Option<NodeId>), StorageError>;

    /// Append entries after the last stored entry.
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// All stored entries in index order, used for recovery.
    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError>;

    /// Entries with `from <= index < to`.
    fn read_range(&self, from: LogIndex, to: LogIndex) -> Result<Vec<LogEntry>, StorageError> {
        Ok(self
            .load_log()?
            .into_iter()
            .filter(|entry| entry.index >= from && entry.index < to)
            .collect())
    }

    /// Remove the entry at `from_index` and everything after it.
    fn truncate_log_from(&mut self, from_index: LogIndex) -> Result<(), StorageError>;

    /// Flush anything outstanding; a node that saw a write fail calls this before it acts again.
    fn sync(&mut self) -> Result<(), StorageError>;
}

/// File-based storage in a directory:
/// - `meta.json`: term and vote, replaced atomically
/// - `log.jsonl`: one JSON entry per line, appended and fsynced
pub struct FileStorage {
    dir: PathBuf,
    /// bytes of `log.jsonl` holding complete, acknowledged records
    log_len: u64,
}

#[derive(Serialize, Deserialize, Default)]
struct Meta {
    term: Term,
    voted_for: Option<NodeId>,
}

impl FileStorage {
    /// Open (creating if needed) the storage directory. A record torn by a crash mid-append is cut off the end of
    /// the log, so later appends start on a fresh line.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let mut storage = Self { dir, log_len: 0 };
        storage.log_len = storage.complete_len()?;
        storage.cut_log(storage.log_len)?;
        Ok(storage)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log.jsonl")
    }

    /// Length of the log up to and including its last newline.
    fn complete_len(&self) -> Result<u64, StorageError> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(0);
        }
        let bytes = fs::read(path)?;
        Ok(bytes
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |last| last as u64 + 1))
    }

    /// Drop anything in the log file past `len`.
    fn cut_log(&self, len: u64) -> Result<(), StorageError> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(());
        }
        let file = OpenOptions::new().write(true).open(&path)?;
        let actual = file.metadata()?.len();
        if actual > len {
            log::warn!(
                "dropping {} unacknowledged bytes at end of {:?}",
                actual - len,
                path
            );
            file.set_len(len)?;
            file.sync_all()?;
        }
        Ok(())
    }

    /// Write `contents` to a temp file, fsync it and rename it over `path`.
    fn replace(&self, path: &Path, contents: &[u8]) -> Result<(), StorageError> {
        let temp_path = path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)?;
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<(), StorageError> {
        let json = serde_json::to_vec(&Meta { term, voted_for })?;
        self.replace(&self.meta_path(), &json)
    }

    fn load_term_and_vote(&self) -> Result<(Term, Option<NodeId>), StorageError> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok((0, None));
        }
        let meta: Meta = serde_json::from_slice(&fs::read(path)?)?;
        Ok((meta.term, meta.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        self.cut_log(self.log_len)?;
        let mut file = OpenOptions::new().create(true).append(true).open(self.log_path())?;
        if let Err(e) = file.write_all(&buf).and_then(|()| file.sync_data()) {
            // an unacknowledged batch must not survive into the next append
            if let Err(rollback) = file.set_len(self.log_len).and_then(|()| file.sync_all()) {
                log::error!("could not roll back failed append to {:?}: {}", self.log_path(), rollback);
            }
            return Err(e.into());
        }
        self.log_len += buf.len() as u64;
        Ok(())
    }

    /// A torn final line is dropped: its append never returned, so it was never acknowledged.
    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut lines = BufReader::new(File::open(path)?).lines().peekable();
        let mut log = Vec::new();
        while let Some(line) = lines.next() {
            let line = line?;
            match serde_json::from_str::<LogEntry>(&line) {
                Ok(entry) => log.push(entry),
                Err(e) if lines.peek().is_none() => {
                    log::warn!("dropping torn log record at end of {:?}: {}", self.log_path(), e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(log)
    }

    fn truncate_log_from(&mut self, from_index: LogIndex) -> Result<(), StorageError> {
        let mut buf = Vec::new();
        for entry in self.load_log()?.iter().filter(|e| e.index < from_index) {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        self.replace(&self.log_path(), &buf)?;
        self.log_len = buf.len() as u64;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        self.cut_log(self.log_len)?;
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

/// Shared switch making a [`MemoryStorage`] fail every write while it is on.
#[derive(Clone, Default)]
pub struct FaultSwitch(Arc<AtomicBool>);

impl FaultSwitch {
    pub fn fail(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn restore(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    fn failing(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// In-memory storage, nothing survives the process.
#[derive(Default)]
pub struct MemoryStorage {
    term: Term,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry>,
    faults: FaultSwitch,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage which already holds state, as if recovered after a restart.
    pub fn with_state(term: Term, voted_for: Option<NodeId>, log: Vec<LogEntry>) -> Self {
        Self {
            term,
            voted_for,
            log,
            faults: FaultSwitch::default(),
        }
    }

    pub fn fault_switch(&self) -> FaultSwitch {
        self.faults.clone()
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.faults.failing() {
            Err(StorageError::Unavailable)
        } else {
            Ok(())
        }
    }
}

impl Storage for MemoryStorage {
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<(), StorageError> {
        self.check()?;
        self.term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    fn load_term_and_vote(&self) -> Result<(Term, Option<NodeId>), StorageError> {
        Ok((self.term, self.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        self.check()?;
        self.log.extend_from_slice(entries);
        Ok(())
    }

    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError> {
        Ok(self.log.clone())
    }

    fn truncate_log_from(&mut self, from_index: LogIndex) -> Result<(), StorageError> {
        self.check()?;
        self.log.retain(|e| e.index < from_index);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        self.check()
    }
}
