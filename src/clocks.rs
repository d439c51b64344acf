//! Monotonic clock tables.
//!
//! A clock tracks how much of a document's history has passed a particular
//! boundary (produced locally, pushed to a peer, pulled from a peer). Clocks
//! only ever move forward; a write with an older timestamp is a silent
//! no-op, which makes stale or duplicated network acks harmless.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::DocId;

/// Timestamp of the latest known update for a document, for one boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocClock {
    /// The document.
    pub doc: DocId,
    /// Milliseconds timestamp of the latest update past this boundary.
    pub timestamp: u64,
}

/// Per-document timestamps for one clock boundary.
#[derive(Debug, Serialize, Deserialize, Clone, Eq, PartialEq, Default)]
pub struct ClockTable {
    clocks: BTreeMap<DocId, u64>,
}

impl ClockTable {
    /// Insert a new timestamp. Never moves a clock backward.
    pub fn insert(&mut self, doc: DocId, timestamp: u64) {
        self.clocks
            .entry(doc)
            .and_modify(|t| *t = (*t).max(timestamp))
            .or_insert(timestamp);
    }

    /// Get the timestamp for a document.
    pub fn get(&self, doc: &DocId) -> Option<u64> {
        self.clocks.get(doc).copied()
    }

    /// Iterate over the entries in this table.
    pub fn iter(&self) -> std::collections::btree_map::Iter<DocId, u64> {
        self.clocks.iter()
    }

    /// Number of documents tracked.
    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    /// Drop all entries.
    pub fn clear(&mut self) {
        self.clocks.clear()
    }

    /// Collect into a batch of [`DocClock`]s.
    pub fn to_doc_clocks(&self) -> Vec<DocClock> {
        self.clocks
            .iter()
            .map(|(doc, timestamp)| DocClock {
                doc: *doc,
                timestamp: *timestamp,
            })
            .collect()
    }
}
