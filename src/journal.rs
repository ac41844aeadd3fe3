//! Append-only record of controller notifications and log lines.
//!
//! The journal lives for the whole application session. Entries are never
//! removed or rewritten; readers get snapshots.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Category of a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Phase,
    Log,
    Fault,
}

/// Represents a single journal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: EntryKind,
    pub message: String,
}

impl fmt::Display for JournalEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let local: DateTime<Local> = self.timestamp.into();
        match self.kind {
            EntryKind::Fault => write!(f, "[{}] FAULT: {}", local.format("%H:%M:%S"), self.message),
            _ => write!(f, "[{}] {}", local.format("%H:%M:%S"), self.message),
        }
    }
}

/// A thread-safe, append-only journal. Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct RunJournal(Arc<Mutex<Vec<JournalEntry>>>);

impl RunJournal {
    /// Create an empty journal
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<JournalEntry>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an entry stamped with the current time.
    pub fn append(&self, kind: EntryKind, message: impl Into<String>) {
        self.append_at(Utc::now(), kind, message);
    }

    /// Append an entry with an explicit timestamp.
    pub fn append_at(&self, timestamp: DateTime<Utc>, kind: EntryKind, message: impl Into<String>) {
        self.lock().push(JournalEntry {
            timestamp,
            kind,
            message: message.into(),
        });
    }

    /// Snapshot of all entries in append order
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.lock().clone()
    }

    /// The most recent `n` entries
    pub fn tail(&self, n: usize) -> Vec<JournalEntry> {
        let entries = self.lock();
        entries[entries.len().saturating_sub(n)..].to_vec()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_entries() {
        let journal = RunJournal::new();
        let other = journal.clone();
        journal.append(EntryKind::Log, "first");
        other.append(EntryKind::Fault, "second");

        let entries = journal.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "first");
        assert_eq!(entries[1].kind, EntryKind::Fault);
    }

    #[test]
    fn test_tail() {
        let journal = RunJournal::new();
        assert!(journal.tail(3).is_empty());
        for i in 0..5 {
            journal.append(EntryKind::Log, format!("line {i}"));
        }
        let tail = journal.tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1].message, "line 4");
    }

    #[test]
    fn test_display_marks_faults() {
        let journal = RunJournal::new();
        journal.append(EntryKind::Fault, "relay stuck");
        let rendered = journal.entries()[0].to_string();
        assert!(rendered.starts_with('['));
        assert!(rendered.ends_with("FAULT: relay stuck"));
    }
}
