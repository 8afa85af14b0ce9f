//! Storage contract for the replicated log.
//!
//! The consensus core only talks to the log through [`LogStore`], so the
//! backing medium is pluggable. [`InmemLogStore`] is the volatile default:
//! everything is lost when the process exits.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

use crate::message::{LogEntry, LogIndex};

/// Log store shared between the node's state loop (the only writer) and the
/// leader's replication loops (readers).
pub type SharedLog = Arc<RwLock<Box<dyn LogStore>>>;

pub fn shared(store: impl LogStore + 'static) -> SharedLog {
    Arc::new(RwLock::new(Box::new(store)))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("no log entry at index {0}")]
    NotFound(LogIndex),

    #[error("log entry {got} breaks contiguity, expected index {expected}")]
    NonContiguous { expected: LogIndex, got: LogIndex },

    #[error("cannot delete range [{from}, {to})")]
    InvalidRange { from: LogIndex, to: LogIndex },
}

/// Ordered storage for log entries, addressed by index.
///
/// Entries handed out by [`LogStore::get_log`] are copies; rewriting an index
/// always goes through [`LogStore::delete_range`] followed by a set.
pub trait LogStore: Send + Sync {
    /// Index of the first stored entry, or 0 when empty.
    fn first_index(&self) -> LogIndex;

    /// Index of the last stored entry, or 0 when empty.
    fn last_index(&self) -> LogIndex;

    fn get_log(&self, index: LogIndex) -> Result<LogEntry, StoreError>;

    /// Appends one entry. Its index must directly follow the last stored one.
    fn set_log(&mut self, entry: LogEntry) -> Result<(), StoreError> {
        self.set_logs(&[entry])
    }

    /// Appends a contiguous batch. Nothing is written if any entry is out of place.
    fn set_logs(&mut self, entries: &[LogEntry]) -> Result<(), StoreError>;

    /// Removes the entries in `[from, to)`.
    fn delete_range(&mut self, from: LogIndex, to: LogIndex) -> Result<(), StoreError>;
}

/// Volatile log store backed by a `Vec`.
#[derive(Debug)]
pub struct InmemLogStore {
    entries: Vec<LogEntry>,
    next_index: LogIndex,
}

impl Default for InmemLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InmemLogStore {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_index: 1,
        }
    }

    fn position(&self, index: LogIndex) -> Option<usize> {
        let first = self.entries.first()?.index;
        if index < first {
            return None;
        }
        let pos = (index - first) as usize;
        (pos < self.entries.len()).then_some(pos)
    }
}

impl LogStore for InmemLogStore {
    fn first_index(&self) -> LogIndex {
        self.entries.first().map_or(0, |entry| entry.index)
    }

    fn last_index(&self) -> LogIndex {
        self.entries.last().map_or(0, |entry| entry.index)
    }

    fn get_log(&self, index: LogIndex) -> Result<LogEntry, StoreError> {
        self.position(index)
            .map(|pos| self.entries[pos].clone())
            .ok_or(StoreError::NotFound(index))
    }

    fn set_logs(&mut self, entries: &[LogEntry]) -> Result<(), StoreError> {
        let mut expected = self.next_index;
        for entry in entries {
            if entry.index != expected {
                return Err(StoreError::NonContiguous {
                    expected,
                    got: entry.index,
                });
            }
            expected += 1;
        }
        self.entries.extend_from_slice(entries);
        self.next_index = expected;
        Ok(())
    }

    fn delete_range(&mut self, from: LogIndex, to: LogIndex) -> Result<(), StoreError> {
        if from > to {
            return Err(StoreError::InvalidRange { from, to });
        }
        let first = self.first_index();
        let last = self.last_index();
        if self.entries.is_empty() || from == to || to <= first || from > last {
            return Ok(());
        }

        let from = from.max(first);
        let to = to.min(last + 1);
        if from > first && to <= last {
            // Removing an interior range would leave a hole.
            return Err(StoreError::InvalidRange { from, to });
        }

        let start = (from - first) as usize;
        let end = (to - first) as usize;
        self.entries.drain(start..end);
        if to > last {
            self.next_index = from;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: LogIndex, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            command: format!("cmd-{index}").into_bytes(),
        }
    }

    fn store_with(terms: &[u64]) -> InmemLogStore {
        let mut store = InmemLogStore::new();
        let entries: Vec<LogEntry> = terms
            .iter()
            .enumerate()
            .map(|(i, &term)| entry(i as LogIndex + 1, term))
            .collect();
        store.set_logs(&entries).expect("contiguous batch");
        store
    }

    #[test]
    fn empty_store_reports_zero_bounds() {
        let store = InmemLogStore::new();
        assert_eq!(store.first_index(), 0);
        assert_eq!(store.last_index(), 0);
        assert_eq!(store.get_log(1), Err(StoreError::NotFound(1)));
    }

    #[test]
    fn append_and_read_back() {
        let mut store = InmemLogStore::new();
        store.set_log(entry(1, 1)).unwrap();
        store.set_logs(&[entry(2, 1), entry(3, 2)]).unwrap();

        assert_eq!(store.first_index(), 1);
        assert_eq!(store.last_index(), 3);
        assert_eq!(store.get_log(3).unwrap().term, 2);
        assert_eq!(store.get_log(4), Err(StoreError::NotFound(4)));
        assert_eq!(store.get_log(0), Err(StoreError::NotFound(0)));
    }

    #[test]
    fn rejects_gaps_without_partial_writes() {
        let mut store = store_with(&[1, 1]);

        let err = store.set_logs(&[entry(3, 1), entry(5, 1)]).unwrap_err();
        assert_eq!(err, StoreError::NonContiguous { expected: 4, got: 5 });
        assert_eq!(store.last_index(), 2);

        let err = store.set_log(entry(2, 2)).unwrap_err();
        assert_eq!(err, StoreError::NonContiguous { expected: 3, got: 2 });
    }

    #[test]
    fn truncate_suffix_then_overwrite() {
        let mut store = store_with(&[1, 1, 2, 2]);

        store.delete_range(3, 5).unwrap();
        assert_eq!(store.last_index(), 2);

        store.set_logs(&[entry(3, 3), entry(4, 3)]).unwrap();
        assert_eq!(store.get_log(3).unwrap().term, 3);
        assert_eq!(store.get_log(4).unwrap().term, 3);
    }

    #[test]
    fn delete_everything_restarts_at_the_deleted_index() {
        let mut store = store_with(&[1, 1]);
        store.delete_range(1, 10).unwrap();

        assert_eq!(store.last_index(), 0);
        store.set_log(entry(1, 4)).unwrap();
        assert_eq!(store.get_log(1).unwrap().term, 4);
    }

    #[test]
    fn delete_prefix_keeps_the_tail_addressable() {
        let mut store = store_with(&[1, 1, 1]);
        store.delete_range(1, 3).unwrap();

        assert_eq!(store.first_index(), 3);
        assert_eq!(store.last_index(), 3);
        assert!(store.get_log(2).is_err());
        store.set_log(entry(4, 1)).unwrap();
    }

    #[test]
    fn interior_and_inverted_ranges_are_rejected() {
        let mut store = store_with(&[1, 1, 1, 1]);

        assert!(matches!(
            store.delete_range(2, 3),
            Err(StoreError::InvalidRange { .. })
        ));
        assert_eq!(
            store.delete_range(3, 2),
            Err(StoreError::InvalidRange { from: 3, to: 2 })
        );
        assert_eq!(store.last_index(), 4);

        // Ranges outside the stored bounds are no-ops.
        store.delete_range(9, 12).unwrap();
        assert_eq!(store.last_index(), 4);
    }
}
