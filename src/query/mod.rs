//! Query definitions for live result sets.
//!
//! A [`Query`] selects records with a [`Predicate`], orders them with one or
//! more [`SortDescriptor`]s and can group the ordered result into sections by
//! a [`KeyPath`]. Queries are immutable once handed to a stream.
//!
//! # Example
//!
//! ```ignore
//! let query = Query::new(Predicate::record_type("task"))
//!     .sorted_by(SortDescriptor::ascending("status"))
//!     .sorted_by(SortDescriptor::descending("@timestamp"))
//!     .sectioned_by("status")
//!     .cached_as("tasks-by-status");
//! ```

mod eval;

pub use eval::{compare_values, group_sections, index_title, resolve, section_name};
pub(crate) use eval::execute;

use crate::error::{Result, StoreError};
use crate::types::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Metadata keys that address record fields instead of the payload.
pub const META_ID: &str = "@id";
pub const META_TYPE: &str = "@type";
pub const META_SEQUENCE: &str = "@sequence";
pub const META_TIMESTAMP: &str = "@timestamp";

/// Dot-separated path into a record's JSON payload, or one of the `@`
/// metadata keys.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyPath(String);

impl KeyPath {
    pub fn new(path: impl Into<String>) -> Self {
        KeyPath(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_meta(&self) -> bool {
        self.0.starts_with('@')
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(StoreError::InvalidQuery("empty key path".into()));
        }
        if self.is_meta() {
            return match self.0.as_str() {
                META_ID | META_TYPE | META_SEQUENCE | META_TIMESTAMP => Ok(()),
                other => Err(StoreError::InvalidQuery(format!(
                    "unknown metadata key: {}",
                    other
                ))),
            };
        }
        if self.segments().any(str::is_empty) {
            return Err(StoreError::InvalidQuery(format!(
                "key path has an empty segment: {:?}",
                self.0
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPath({})", self.0)
    }
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        KeyPath::new(path)
    }
}

impl From<String> for KeyPath {
    fn from(path: String) -> Self {
        KeyPath(path)
    }
}

/// Filter over records.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// Matches every record.
    #[default]
    All,
    /// Record type equals.
    RecordType(String),
    Eq(KeyPath, Value),
    Ne(KeyPath, Value),
    Lt(KeyPath, Value),
    Le(KeyPath, Value),
    Gt(KeyPath, Value),
    Ge(KeyPath, Value),
    /// Key path resolves to a non-null value.
    Exists(KeyPath),
    /// String value at key path contains the substring.
    Contains(KeyPath, String),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn record_type(record_type: impl Into<String>) -> Self {
        Predicate::RecordType(record_type.into())
    }

    pub fn equals(path: impl Into<KeyPath>, value: impl Into<Value>) -> Self {
        Predicate::Eq(path.into(), value.into())
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And(mut all) => {
                all.push(other);
                Predicate::And(all)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Evaluate against a record. The payload is parsed once per call.
    pub fn matches(&self, record: &Record) -> bool {
        let payload = record.json();
        self.matches_parsed(record, payload.as_ref())
    }

    pub(crate) fn matches_parsed(&self, record: &Record, payload: Option<&Value>) -> bool {
        use std::cmp::Ordering::*;

        let cmp = |path: &KeyPath, value: &Value| {
            compare_values(&resolve(record, payload, path), value)
        };

        match self {
            Predicate::All => true,
            Predicate::RecordType(t) => record.record_type == *t,
            Predicate::Eq(path, value) => resolve(record, payload, path) == *value,
            Predicate::Ne(path, value) => resolve(record, payload, path) != *value,
            Predicate::Lt(path, value) => cmp(path, value) == Less,
            Predicate::Le(path, value) => cmp(path, value) != Greater,
            Predicate::Gt(path, value) => cmp(path, value) == Greater,
            Predicate::Ge(path, value) => cmp(path, value) != Less,
            Predicate::Exists(path) => !resolve(record, payload, path).is_null(),
            Predicate::Contains(path, needle) => match resolve(record, payload, path) {
                Value::String(s) => s.contains(needle.as_str()),
                _ => false,
            },
            Predicate::And(all) => all.iter().all(|p| p.matches_parsed(record, payload)),
            Predicate::Or(any) => any.iter().any(|p| p.matches_parsed(record, payload)),
            Predicate::Not(inner) => !inner.matches_parsed(record, payload),
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Predicate::All | Predicate::RecordType(_) => Ok(()),
            Predicate::Eq(path, _)
            | Predicate::Ne(path, _)
            | Predicate::Lt(path, _)
            | Predicate::Le(path, _)
            | Predicate::Gt(path, _)
            | Predicate::Ge(path, _)
            | Predicate::Exists(path)
            | Predicate::Contains(path, _) => path.validate(),
            Predicate::And(all) | Predicate::Or(all) => all.iter().try_for_each(Predicate::validate),
            Predicate::Not(inner) => inner.validate(),
        }
    }
}

/// One ordering key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SortDescriptor {
    pub key: KeyPath,
    pub ascending: bool,
}

impl SortDescriptor {
    pub fn ascending(key: impl Into<KeyPath>) -> Self {
        Self {
            key: key.into(),
            ascending: true,
        }
    }

    pub fn descending(key: impl Into<KeyPath>) -> Self {
        Self {
            key: key.into(),
            ascending: false,
        }
    }
}

/// Parameters of a live query.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Which records belong to the result.
    pub predicate: Predicate,

    /// Result ordering. At least one descriptor is required to fetch.
    pub sort: Vec<SortDescriptor>,

    /// Group the ordered result into sections by this key path.
    pub section_key: Option<KeyPath>,

    /// Name under which the store caches the fetched result.
    pub cache_name: Option<String>,
}

impl Query {
    pub fn new(predicate: Predicate) -> Self {
        Self {
            predicate,
            ..Default::default()
        }
    }

    pub fn sorted_by(mut self, descriptor: SortDescriptor) -> Self {
        self.sort.push(descriptor);
        self
    }

    pub fn sectioned_by(mut self, key: impl Into<KeyPath>) -> Self {
        self.section_key = Some(key.into());
        self
    }

    pub fn cached_as(mut self, name: impl Into<String>) -> Self {
        self.cache_name = Some(name.into());
        self
    }

    pub fn is_sectioned(&self) -> bool {
        self.section_key.is_some()
    }

    /// Check that the query can be executed.
    ///
    /// Sections must be contiguous in the sorted result, so a section key
    /// must also be the first sort key.
    pub fn validate(&self) -> Result<()> {
        self.predicate.validate()?;

        let first = self.sort.first().ok_or_else(|| {
            StoreError::InvalidQuery("at least one sort descriptor is required".into())
        })?;
        for descriptor in &self.sort {
            descriptor.key.validate()?;
        }

        if let Some(ref section_key) = self.section_key {
            section_key.validate()?;
            if first.key != *section_key {
                return Err(StoreError::InvalidQuery(format!(
                    "section key {} must be the first sort key (found {})",
                    section_key.as_str(),
                    first.key.as_str()
                )));
            }
        }

        Ok(())
    }

    /// Stable identity of what this query selects and how, ignoring the
    /// cache name.
    pub(crate) fn fingerprint(&self) -> String {
        format!("{:?}|{:?}|{:?}", self.predicate, self.sort, self.section_key)
    }
}
