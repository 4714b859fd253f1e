//! Core types for the record store.

use crate::error::{Result, StoreError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier for a record.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-wide commit position. Every committed write gets the next one.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl Sequence {
    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time. A clock set before the epoch reads as zero.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Payload encoding format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadEncoding {
    #[default]
    Json,
    Raw,
}

impl PayloadEncoding {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            PayloadEncoding::Json => 0,
            PayloadEncoding::Raw => 1,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(PayloadEncoding::Json),
            1 => Some(PayloadEncoding::Raw),
            _ => None,
        }
    }
}

/// A single live record in the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique identifier (assigned by store on insert).
    pub id: RecordId,

    /// Sequence of the commit that produced this version.
    pub sequence: Sequence,

    /// When this version was written.
    pub timestamp: Timestamp,

    /// Application-defined type (e.g., "task", "message").
    pub record_type: String,

    /// Application-defined payload.
    pub payload: Vec<u8>,

    /// Payload encoding.
    pub encoding: PayloadEncoding,
}

impl Record {
    /// Parse the payload as JSON. Raw or malformed payloads yield `None`.
    pub fn json(&self) -> Option<serde_json::Value> {
        match self.encoding {
            PayloadEncoding::Json => serde_json::from_slice(&self.payload).ok(),
            PayloadEncoding::Raw => None,
        }
    }

    /// Decode a JSON payload into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        if self.encoding != PayloadEncoding::Json {
            return Err(StoreError::Deserialization(format!(
                "record {} has a raw payload",
                self.id
            )));
        }
        serde_json::from_slice(&self.payload).map_err(|e| StoreError::Deserialization(e.to_string()))
    }
}

/// Input for creating or replacing a record (before id/sequence assigned).
#[derive(Clone, Debug)]
pub struct RecordInput {
    pub record_type: String,
    pub payload: Vec<u8>,
    pub encoding: PayloadEncoding,
}

impl RecordInput {
    /// Create a new record input with JSON payload.
    pub fn json(record_type: impl Into<String>, payload: &impl Serialize) -> Result<Self> {
        Ok(Self {
            record_type: record_type.into(),
            payload: serde_json::to_vec(payload)?,
            encoding: PayloadEncoding::Json,
        })
    }

    /// Create a new record input with raw bytes.
    pub fn raw(record_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            record_type: record_type.into(),
            payload,
            encoding: PayloadEncoding::Raw,
        }
    }
}

/// One record-level change inside a commit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    Inserted { record: Record },
    Updated { before: Record, after: Record },
    Deleted { record: Record },
}

impl Change {
    /// Every record version touched by this change (old and new).
    pub fn versions(&self) -> impl Iterator<Item = &Record> {
        let (first, second) = match self {
            Change::Inserted { record } => (record, None),
            Change::Updated { before, after } => (before, Some(after)),
            Change::Deleted { record } => (record, None),
        };
        std::iter::once(first).chain(second)
    }
}

/// Changes committed together, broadcast to store observers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeSet {
    pub sequence: Sequence,
    pub changes: Vec<Change>,
}

/// Store statistics.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub record_count: u64,
    pub log_size_bytes: u64,
    pub sequence: Sequence,
    pub observer_count: usize,
    pub query_cache_hits: u64,
}
