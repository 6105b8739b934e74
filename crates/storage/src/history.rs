//! Per-key record history
//!
//! A [`KeyHistory`] keeps the records of one key ordered by timestamp. The
//! records live in an `Arc<Vec<_>>`: readers take a [`HistorySnapshot`]
//! (a reference count bump) and keep a consistent view while writers
//! copy-on-write through `Arc::make_mut`.

use backfill_core::{Key, Record, Timestamp};
use std::sync::Arc;

/// Ordered records of one key.
#[derive(Debug, Clone)]
pub struct KeyHistory {
    key: Key,
    records: Arc<Vec<Record>>,
}

impl KeyHistory {
    /// Empty history for `key`
    pub fn new(key: Key) -> Self {
        KeyHistory {
            key,
            records: Arc::new(Vec::new()),
        }
    }

    /// The key this history belongs to
    pub fn key(&self) -> Key {
        self.key
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if no record is stored
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert records, keeping timestamp order.
    ///
    /// Records without a timestamp, or belonging to another key, are
    /// dropped. Records with equal timestamps keep their arrival order.
    /// Returns the number of records stored.
    pub fn insert(&mut self, records: impl IntoIterator<Item = Record>) -> usize {
        let key = self.key;
        let mut incoming: Vec<Record> = records
            .into_iter()
            .filter(|r| r.timestamp().is_some() && r.key() == key)
            .collect();
        if incoming.is_empty() {
            return 0;
        }
        let added = incoming.len();

        let records = Arc::make_mut(&mut self.records);
        records.append(&mut incoming);
        // stable and linear on already-ordered runs
        records.sort_by_key(|r| r.timestamp());
        added
    }

    /// Consistent read-only view of the current records
    pub fn snapshot(&self) -> HistorySnapshot {
        HistorySnapshot {
            key: self.key,
            records: Arc::clone(&self.records),
        }
    }
}

/// Immutable view of a key's history at the moment it was taken.
#[derive(Debug, Clone)]
pub struct HistorySnapshot {
    key: Key,
    records: Arc<Vec<Record>>,
}

impl HistorySnapshot {
    /// The key this snapshot belongs to
    pub fn key(&self) -> Key {
        self.key
    }

    /// Records in timestamp order
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if the snapshot holds no record
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Latest record with a timestamp at or before `time`
    pub fn value_at(&self, time: Timestamp) -> Option<&Record> {
        let idx = self
            .records
            .partition_point(|r| r.timestamp().map_or(true, |ts| ts <= time));
        idx.checked_sub(1).map(|i| &self.records[i])
    }

    /// Records with timestamps inside `[start, end]`
    pub fn range(&self, start: Timestamp, end: Timestamp) -> &[Record] {
        let from = self
            .records
            .partition_point(|r| r.timestamp().map_or(true, |ts| ts < start));
        let to = self
            .records
            .partition_point(|r| r.timestamp().map_or(true, |ts| ts <= end));
        if from >= to {
            &[]
        } else {
            &self.records[from..to]
        }
    }
}
