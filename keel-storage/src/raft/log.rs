use super::command::CommandPayload;
use crate::journal::JournalReader;
use keel_common::error::{KeelError, Result};
use keel_common::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};

/// A single entry in the Raft log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,        // Position in the log, starting at 1
    pub term: Term,             // Term when entry was received by leader
    pub payload: EntryPayload,  // What applying the entry does
}

/// Type of log entry — determines how the apply stage interprets the entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    Command(CommandPayload), // Client command routed through the command registry
    Noop,                    // Appended by a new leader to commit earlier terms
}

impl LogEntry {
    pub fn command(index: LogIndex, term: Term, command: CommandPayload) -> Self {
        Self {
            index,
            term,
            payload: EntryPayload::Command(command),
        }
    }

    pub fn noop(index: LogIndex, term: Term) -> Self {
        Self {
            index,
            term,
            payload: EntryPayload::Noop,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// In-memory view of one node's log. Entries are contiguous from index 1.
#[derive(Debug, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    /// Create an empty Raft log
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the log from the journal. A later record at an index that is
    /// already present replaces it and everything after it, which replays
    /// follower truncations.
    pub fn recover(reader: &JournalReader) -> Result<Self> {
        let mut log = Self::new();
        for record in reader.read_all()? {
            let entry = LogEntry::decode(&record.payload)?;
            log.set(entry)?;
        }
        Ok(log)
    }

    /// Append the next entry. Its index must directly follow the last one and
    /// its term may not go backwards.
    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        if entry.index != self.last_index() + 1 {
            return Err(KeelError::Validation(format!(
                "entry index {} does not follow last index {}",
                entry.index,
                self.last_index()
            )));
        }
        if entry.term < self.last_term() {
            return Err(KeelError::Validation(format!(
                "entry term {} is below last term {}",
                entry.term,
                self.last_term()
            )));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Places `entry` at its index, discarding whatever was there and after it.
    pub fn set(&mut self, entry: LogEntry) -> Result<()> {
        if entry.index < 1 {
            return Err(KeelError::Validation(format!(
                "log index must be at least 1, got {}",
                entry.index
            )));
        }
        if entry.index <= self.last_index() {
            self.truncate_from(entry.index);
        }
        self.append(entry)
    }

    /// Get a specific log entry by Raft log index
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term of the entry at `index`; index 0 is the empty prefix with term 0.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|e| e.term)
    }

    /// Returns the last log index, or 0 if the log is empty
    pub fn last_index(&self) -> LogIndex {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }

    /// Returns the term of the last entry, or 0 if empty
    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Up to `max` entries starting at `start`.
    pub fn entries_from(&self, start: LogIndex, max: usize) -> Vec<LogEntry> {
        let start = start.max(1);
        if start > self.last_index() {
            return Vec::new();
        }
        self.entries[(start - 1) as usize..]
            .iter()
            .take(max)
            .cloned()
            .collect()
    }

    /// Drops `index` and everything after it; returns how many entries went.
    pub fn truncate_from(&mut self, index: LogIndex) -> usize {
        let keep = index.saturating_sub(1) as usize;
        let removed = self.entries.len().saturating_sub(keep);
        self.entries.truncate(keep);
        removed
    }

    /// Log-matching check for AppendEntries.
    pub fn matches(&self, prev_index: LogIndex, prev_term: Term) -> bool {
        self.term_at(prev_index) == Some(prev_term)
    }

    /// Whether a candidate whose log ends at (`last_index`, `last_term`) is at
    /// least as up-to-date as this log.
    pub fn is_up_to_date(&self, last_index: LogIndex, last_term: Term) -> bool {
        last_term > self.last_term()
            || (last_term == self.last_term() && last_index >= self.last_index())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
