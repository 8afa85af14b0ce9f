//! Application state machines fed by committed log entries.
//!
//! A node hands every committed entry to its [`StateMachine`] exactly once and
//! in index order. [`KvStore`] is the key-value store served over HTTP.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::warn;

use crate::command::CommandPayload;
use crate::message::LogEntry;

/// Sink for committed entries.
pub trait StateMachine: Send + 'static {
    fn apply(&mut self, entry: &LogEntry);
}

/// Forwards committed entries to a channel, for hosts that consume them elsewhere.
impl StateMachine for mpsc::UnboundedSender<LogEntry> {
    fn apply(&mut self, entry: &LogEntry) {
        // A dropped receiver means nobody is listening anymore.
        let _ = self.send(entry.clone());
    }
}

/// Thread-safe in-memory key-value store.
///
/// The node applies writes through [`StateMachine`] while HTTP handlers read
/// concurrently, so the map sits behind a `Mutex`. `BTreeMap` keeps
/// [`KvStore::snapshot`] output ordered.
#[derive(Debug, Default)]
pub struct KvStore {
    data: Mutex<BTreeMap<String, String>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: String, value: String) {
        self.lock().insert(key, value);
    }

    /// Local read of whatever this node has applied so far.
    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        // Inserts cannot leave the map half-written, so a poisoned lock is still usable.
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StateMachine for Arc<KvStore> {
    fn apply(&mut self, entry: &LogEntry) {
        match CommandPayload::decode(&entry.command) {
            Ok(CommandPayload::Put { key, value }) => self.put(key, value),
            Err(err) => warn!(
                index = entry.index,
                term = entry.term,
                error = %err,
                "skipping entry that is not a key-value command"
            ),
        }
    }
}
