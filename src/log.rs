use super::storage::{Storage, StorageError};
use super::{LogIndex, Term};
use core::ops::Index;
use serde::{Deserialize, Serialize};

/// A single entry in the replicated log. The payload is opaque to consensus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    /// term when the entry was received by the leader
    pub term: Term,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn new(index: LogIndex, term: Term, payload: Vec<u8>) -> Self {
        Self {
            index,
            term,
            payload,
        }
    }
}

/// Append-only, indexed log mirrored in memory and on a [`Storage`].
///
/// Entries are contiguous from index 1. Every mutation reaches the storage first, the in-memory copy
/// only follows once the storage call succeeded, so memory never runs ahead of disk.
pub struct PersistentLog<S> {
    storage: S,
    entries: Vec<LogEntry>,
}

impl<S: Storage> PersistentLog<S> {
    /// Recover the log held by `storage`.
    pub fn recover(storage: S) -> Result<Self, StorageError> {
        let entries = storage.load_log()?;
        for (position, entry) in entries.iter().enumerate() {
            if entry.index != position as LogIndex + 1 {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "log entry at position {} has index {}",
                        position + 1,
                        entry.index
                    ),
                )));
            }
        }
        Ok(Self { storage, entries })
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub(crate) fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map_or(0, |e| e.term)
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    /// Term of the entry at `index`; index 0 is the empty prefix with term 0.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            Some(0)
        } else {
            self.get(index).map(|e| e.term)
        }
    }

    /// Log matching check: does this log contain an entry at `index` whose term is `term`
    pub fn matches(&self, index: LogIndex, term: Term) -> bool {
        self.term_at(index) == Some(term)
    }

    /// Is a log ending at (`last_log_index`, `last_log_term`) at least as up-to-date as this one.
    /// If the logs have last entries with different terms, then the log with the later term is more up-to-date. If
    /// the logs end with the same term, then whichever log is longer is more up-to-date.
    pub fn is_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        (last_log_term, last_log_index) >= (self.last_term(), self.last_index())
    }

    /// Up to `max` entries starting at `from`.
    pub fn entries_from(&self, from: LogIndex, max: usize) -> Vec<LogEntry> {
        let start = from.max(1) as usize - 1;
        self.entries.iter().skip(start).take(max).cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Append a new entry in `term` at the end of the log, returning its index.
    pub fn append(&mut self, term: Term, payload: Vec<u8>) -> Result<LogIndex, StorageError> {
        let entry = LogEntry::new(self.last_index() + 1, term, payload);
        self.storage.append_entries(std::slice::from_ref(&entry))?;
        self.entries.push(entry);
        Ok(self.last_index())
    }

    /// Remove the entry at `index` and everything after it.
    pub fn truncate_from(&mut self, index: LogIndex) -> Result<(), StorageError> {
        if index > self.last_index() {
            return Ok(());
        }
        self.storage.truncate_log_from(index)?;
        self.entries.truncate(index.max(1) as usize - 1);
        Ok(())
    }

    /// Place `entries` after `prev_log_index`, which must already match.
    /// If an existing entry conflicts with a new one (same index but different terms), delete the existing entry and
    /// all that follow it, then append any new entries not already in the log. Entries that already match are kept,
    /// so a stale or repeated request never shortens the log.
    /// Returns the index of the last new entry.
    pub fn append_from(
        &mut self,
        prev_log_index: LogIndex,
        entries: Vec<LogEntry>,
    ) -> Result<LogIndex, StorageError> {
        let mut entries = entries;
        let last_new_entry = prev_log_index + entries.len() as LogIndex;
        let present = entries
            .iter()
            .enumerate()
            .take_while(|(offset, entry)| {
                let index = prev_log_index + 1 + *offset as LogIndex;
                debug_assert_eq!(entry.index, index, "entries must follow prev_log_index");
                self.matches(index, entry.term)
            })
            .count();
        if present < entries.len() {
            let new = entries.split_off(present);
            self.truncate_from(prev_log_index + 1 + present as LogIndex)?;
            self.storage.append_entries(&new)?;
            self.entries.extend(new);
        }
        Ok(last_new_entry)
    }
}

impl<S> Index<LogIndex> for PersistentLog<S> {
    type Output = LogEntry;

    fn index(&self, index: LogIndex) -> &LogEntry {
        &self.entries[index as usize - 1]
    }
}
