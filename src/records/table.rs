//! In-memory table of live records.

use crate::records::log::LogEntry;
use crate::types::{Record, RecordId, Sequence};
use std::collections::{BTreeMap, HashMap};

/// Materialized view of the log: the latest version of every live record.
#[derive(Default)]
pub struct RecordTable {
    /// Live records by id.
    records: BTreeMap<RecordId, Record>,

    /// Record type to record IDs.
    type_index: HashMap<String, Vec<RecordId>>,

    /// Highest id ever assigned (deleted ids are never reused).
    max_id: u64,

    /// Sequence of the last applied entry.
    sequence: Sequence,
}

impl RecordTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a table from replayed log entries.
    pub fn from_entries(entries: impl IntoIterator<Item = LogEntry>) -> Self {
        let mut table = Self::new();
        for entry in entries {
            table.apply(entry);
        }
        table
    }

    /// Apply one entry, returning the replaced or removed version.
    pub fn apply(&mut self, entry: LogEntry) -> Option<Record> {
        self.sequence = self.sequence.max(entry.sequence());

        match entry {
            LogEntry::Put(record) => {
                let id = record.id;
                self.max_id = self.max_id.max(id.0);

                let previous = self.records.insert(id, record.clone());
                if let Some(ref old) = previous {
                    if old.record_type != record.record_type {
                        self.unindex(&old.record_type, id);
                        self.type_index.entry(record.record_type).or_default().push(id);
                    }
                } else {
                    self.type_index.entry(record.record_type).or_default().push(id);
                }
                previous
            }
            LogEntry::Delete { id, .. } => {
                let removed = self.records.remove(&id);
                if let Some(ref old) = removed {
                    self.unindex(&old.record_type, id);
                }
                removed
            }
        }
    }

    fn unindex(&mut self, record_type: &str, id: RecordId) {
        if let Some(ids) = self.type_index.get_mut(record_type) {
            ids.retain(|existing| *existing != id);
            if ids.is_empty() {
                self.type_index.remove(record_type);
            }
        }
    }

    pub fn get(&self, id: RecordId) -> Option<&Record> {
        self.records.get(&id)
    }

    /// Live records in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    /// Live records of one type, in insertion order.
    pub fn by_type(&self, record_type: &str) -> Vec<RecordId> {
        self.type_index.get(record_type).cloned().unwrap_or_default()
    }

    pub fn next_id(&self) -> RecordId {
        RecordId(self.max_id + 1)
    }

    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
