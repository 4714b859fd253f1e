//! Mapped result sections.

use crate::mapper::ValueMapper;
use crate::observation::RawSection;
use serde::{Deserialize, Serialize};

/// One named group of mapped values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Section<T> {
    pub name: Option<String>,
    pub index_title: Option<String>,
    pub values: Vec<T>,
}

impl<T> Section<T> {
    /// A section without name or index title.
    pub fn unnamed(values: Vec<T>) -> Self {
        Self {
            name: None,
            index_title: None,
            values,
        }
    }

    /// Map a raw section, keeping its name and index title even when every
    /// record is rejected.
    pub fn from_raw<R>(raw: &RawSection<R>, mapper: &ValueMapper<R, T>) -> Self {
        Self {
            name: raw.name.clone(),
            index_title: raw.index_title.clone(),
            values: mapper.map_all(&raw.records),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Snapshot emitted by a sectioned stream.
pub type SectionedResult<T> = Vec<Section<T>>;
