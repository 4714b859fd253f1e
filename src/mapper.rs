//! Record-to-value conversion.

use crate::types::Record;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;

/// Converts raw records into the values a stream emits.
///
/// Returning `None` excludes the record from the emitted result. This is how
/// malformed or unconvertible records are filtered; it is not an error. The
/// function must not touch subscription state and may run on any thread.
pub struct ValueMapper<I, O> {
    convert: Arc<dyn Fn(&I) -> Option<O> + Send + Sync>,
}

impl<I, O> ValueMapper<I, O> {
    pub fn new<F>(convert: F) -> Self
    where
        F: Fn(&I) -> Option<O> + Send + Sync + 'static,
    {
        Self {
            convert: Arc::new(convert),
        }
    }

    pub fn map(&self, input: &I) -> Option<O> {
        (self.convert)(input)
    }

    /// Map a slice, keeping the relative order of accepted values.
    pub fn map_all(&self, inputs: &[I]) -> Vec<O> {
        inputs.iter().filter_map(|input| self.map(input)).collect()
    }
}

impl<I: Clone + 'static> ValueMapper<I, I> {
    /// Emit records unchanged (cloned out of the snapshot).
    pub fn identity() -> Self {
        Self::new(|input: &I| Some(input.clone()))
    }
}

impl<O: DeserializeOwned + 'static> ValueMapper<Record, O> {
    /// Decode JSON payloads with serde, skipping records that do not decode.
    pub fn json() -> Self {
        Self::new(|record: &Record| record.decode().ok())
    }
}

impl<I, O> Clone for ValueMapper<I, O> {
    fn clone(&self) -> Self {
        Self {
            convert: Arc::clone(&self.convert),
        }
    }
}

impl<I, O> fmt::Debug for ValueMapper<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueMapper").finish_non_exhaustive()
    }
}
