//! Live query observation.
//!
//! An [`ObservationHandle`] tracks the result set of one query: it performs
//! the initial fetch, exposes the latest snapshot (flat or sectioned) and
//! calls back whenever the tracked result set changes. Handles are created by
//! an [`ObservationSource`], the store-side factory a result stream holds.
//!
//! [`LiveQuery`] is the handle implementation backed by [`Store`].
//!
//! [`Store`]: crate::Store

mod live;

pub use live::LiveQuery;

use crate::error::{Result, StoreError};
use crate::query::Query;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What an observation handle reports to its change callback.
#[derive(Debug)]
pub enum ChangeNotice {
    /// The tracked result set changed; read the current snapshot.
    Changed,
    /// Observation cannot continue.
    Failed(StoreError),
}

/// Callback invoked when an observed result set changed or failed.
pub type ChangeCallback = Box<dyn Fn(ChangeNotice) + Send + Sync>;

/// One section of a raw (unmapped) query result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawSection<R> {
    pub name: Option<String>,
    pub index_title: Option<String>,
    pub records: Vec<R>,
}

/// Store-side handle over the live result set of one query.
///
/// Snapshot accessors return `None` until a fetch succeeded. Callbacks may
/// arrive on any thread.
pub trait ObservationHandle: Send + Sync + 'static {
    type Record: Send + Sync + 'static;

    /// Execute the query once and start tracking its result set.
    fn perform_initial_fetch(&self) -> Result<()>;

    /// Latest result grouped into sections, if the query is sectioned.
    fn current_sections(&self) -> Option<Arc<Vec<RawSection<Self::Record>>>>;

    /// Latest result as one ordered list.
    fn current_flat_results(&self) -> Option<Arc<Vec<Self::Record>>>;

    /// Register the callback run after the tracked result set changed, or
    /// once when observation fails for good. Replaces any previously
    /// registered callback.
    fn on_change(&self, callback: ChangeCallback);

    /// Stop tracking and drop the callback. Safe to call more than once.
    fn stop(&self);
}

/// Factory for observation handles: the store or context a stream observes.
pub trait ObservationSource: Send + Sync + 'static {
    type Record: Send + Sync + 'static;
    type Handle: ObservationHandle<Record = Self::Record>;

    /// Create an idle handle for a query. No fetch happens until
    /// [`ObservationHandle::perform_initial_fetch`].
    fn observe(&self, query: &Arc<Query>) -> Self::Handle;
}
