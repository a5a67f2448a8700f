//! Replicated log entries

use super::{Index, Term};
use serde::{Deserialize, Serialize};

/// What an entry carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// State machine command
    Command,
    /// JSON-encoded cluster topology
    Topology,
    /// Leader no-op (marks a new term)
    Noop,
}

/// A log entry as sent on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position (≥ 1)
    pub index: Index,
    /// Term of the leader that created it
    pub term: Term,
    /// Payload kind
    pub kind: EntryKind,
    /// Opaque payload
    pub payload: Vec<u8>,
}

impl LogEntry {
    /// Command entry
    pub fn command(index: Index, term: Term, payload: Vec<u8>) -> Self {
        Self {
            index,
            term,
            kind: EntryKind::Command,
            payload,
        }
    }

    /// No-op entry
    pub fn noop(index: Index, term: Term) -> Self {
        Self {
            index,
            term,
            kind: EntryKind::Noop,
            payload: Vec::new(),
        }
    }

    /// Topology entry
    pub fn topology(index: Index, term: Term, payload: Vec<u8>) -> Self {
        Self {
            index,
            term,
            kind: EntryKind::Topology,
            payload,
        }
    }
}

/// Entry as persisted in the log database (the index is the key)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    /// Term
    pub term: Term,
    /// Payload kind
    pub kind: EntryKind,
    /// Payload
    pub payload: Vec<u8>,
}

impl StoredEntry {
    /// Rebuild the wire form
    pub fn into_entry(self, index: Index) -> LogEntry {
        LogEntry {
            index,
            term: self.term,
            kind: self.kind,
            payload: self.payload,
        }
    }
}

impl From<&LogEntry> for StoredEntry {
    fn from(entry: &LogEntry) -> Self {
        Self {
            term: entry.term,
            kind: entry.kind,
            payload: entry.payload.clone(),
        }
    }
}
