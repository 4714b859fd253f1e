//! Observation handle backed by the record store.

use super::{ChangeCallback, ChangeNotice, ObservationHandle, ObservationSource, RawSection};
use crate::error::{Result, StoreError};
use crate::notify::{ObserverId, StoreEvent};
use crate::query::{self, Query};
use crate::store::{QuerySnapshot, Store};
use crate::types::{ChangeSet, Record, Sequence};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Materialized result of the last successful fetch.
struct LiveSnapshot {
    sequence: Sequence,
    flat: Arc<Vec<Record>>,
    sections: Option<Arc<Vec<RawSection<Record>>>>,
}

impl LiveSnapshot {
    fn build(query: &Query, fetched: QuerySnapshot) -> Self {
        let sections = query
            .is_sectioned()
            .then(|| Arc::new(query::group_sections(query, &fetched.records)));
        Self {
            sequence: fetched.sequence,
            flat: Arc::new(fetched.records),
            sections,
        }
    }

    /// Same records in the same order, at the same versions.
    fn same_result(&self, other: &LiveSnapshot) -> bool {
        self.flat.len() == other.flat.len()
            && self
                .flat
                .iter()
                .zip(other.flat.iter())
                .all(|(a, b)| a.id == b.id && a.sequence == b.sequence)
    }
}

struct LiveInner {
    store: Arc<Store>,
    query: Arc<Query>,
    snapshot: RwLock<Option<LiveSnapshot>>,
    callback: Mutex<Option<Arc<dyn Fn(ChangeNotice) + Send + Sync>>>,
    observer: Mutex<Option<ObserverId>>,
    stopped: AtomicBool,
}

impl LiveInner {
    /// Entry point for store events.
    fn handle_event(&self, event: &StoreEvent) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        match event {
            StoreEvent::Committed(changes) => self.handle_changes(changes),
            StoreEvent::Closed => self.notify(ChangeNotice::Failed(StoreError::Closed)),
        }
    }

    fn handle_changes(&self, changes: &ChangeSet) {
        // Nothing to compare against until the initial fetch lands
        if self.snapshot.read().is_none() {
            return;
        }

        let relevant = changes
            .changes
            .iter()
            .flat_map(|change| change.versions())
            .any(|record| self.query.predicate.matches(record));
        if relevant {
            self.refresh();
        }
    }

    /// Refetch and notify if the result set differs from the last snapshot.
    fn refresh(&self) {
        match self.refetch() {
            Ok(true) => self.notify(ChangeNotice::Changed),
            Ok(false) => {}
            Err(StoreError::Closed) => self.notify(ChangeNotice::Failed(StoreError::Closed)),
            Err(e) => {
                tracing::warn!(error = %e, "live query refetch failed, keeping previous snapshot");
            }
        }
    }

    /// Refetch and store the result. Returns whether it differs from the
    /// previous snapshot.
    fn refetch(&self) -> Result<bool> {
        let fetched = self.store.fetch_snapshot(&self.query)?;
        let fresh = LiveSnapshot::build(&self.query, fetched);

        let mut slot = self.snapshot.write();
        let changed = match slot.as_mut() {
            // A concurrent refresh already stored something at least as new
            Some(current) if current.sequence >= fresh.sequence => false,
            Some(current) if current.same_result(&fresh) => {
                current.sequence = fresh.sequence;
                false
            }
            _ => {
                *slot = Some(fresh);
                true
            }
        };
        Ok(changed)
    }

    /// Install the initial snapshot, catching up silently on writes committed
    /// while it was fetched. The caller reads the result right after, so only
    /// later commits may run the callback.
    fn install_initial(&self, fetched: QuerySnapshot) {
        let sequence = fetched.sequence;
        *self.snapshot.write() = Some(LiveSnapshot::build(&self.query, fetched));

        if self.store.sequence() > sequence {
            if let Err(e) = self.refetch() {
                tracing::warn!(error = %e, "live query catch-up failed, keeping initial snapshot");
            }
        }
    }

    fn notify(&self, notice: ChangeNotice) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(notice);
        }
    }
}

/// Live result set of one query over a [`Store`].
///
/// Only changes touching a record that matches the query's predicate (before
/// or after the change) trigger a refetch, and the change callback only runs
/// when the refetched result differs from the previous one. Closing the store
/// reports [`ChangeNotice::Failed`] with [`StoreError::Closed`].
pub struct LiveQuery {
    inner: Arc<LiveInner>,
}

impl LiveQuery {
    pub fn new(store: Arc<Store>, query: Arc<Query>) -> Self {
        Self {
            inner: Arc::new(LiveInner {
                store,
                query,
                snapshot: RwLock::new(None),
                callback: Mutex::new(None),
                observer: Mutex::new(None),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn query(&self) -> &Query {
        &self.inner.query
    }

    /// Sequence the current snapshot reflects.
    pub fn snapshot_sequence(&self) -> Option<Sequence> {
        self.inner.snapshot.read().as_ref().map(|s| s.sequence)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    fn register_observer(&self) -> Result<()> {
        let mut observer = self.inner.observer.lock();
        if observer.is_some() {
            return Ok(());
        }

        let weak: Weak<LiveInner> = Arc::downgrade(&self.inner);
        let id = self.inner.store.add_observer(Arc::new(move |event: &StoreEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_event(event);
            }
        }))?;
        *observer = Some(id);
        Ok(())
    }
}

impl ObservationHandle for LiveQuery {
    type Record = Record;

    fn perform_initial_fetch(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(StoreError::Closed);
        }

        let inner = &self.inner;
        inner.query.validate()?;
        self.register_observer()?;

        let fetched = inner.store.fetch_snapshot(&inner.query)?;
        inner.install_initial(fetched);
        Ok(())
    }

    fn current_sections(&self) -> Option<Arc<Vec<RawSection<Record>>>> {
        self.inner
            .snapshot
            .read()
            .as_ref()
            .and_then(|s| s.sections.clone())
    }

    fn current_flat_results(&self) -> Option<Arc<Vec<Record>>> {
        self.inner.snapshot.read().as_ref().map(|s| Arc::clone(&s.flat))
    }

    fn on_change(&self, callback: ChangeCallback) {
        *self.inner.callback.lock() = Some(Arc::from(callback));
    }

    fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(id) = self.inner.observer.lock().take() {
            self.inner.store.remove_observer(id);
        }
        self.inner.callback.lock().take();
        self.inner.snapshot.write().take();
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ObservationSource for Arc<Store> {
    type Record = Record;
    type Handle = LiveQuery;

    fn observe(&self, query: &Arc<Query>) -> LiveQuery {
        LiveQuery::new(Arc::clone(self), Arc::clone(query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Predicate, SortDescriptor};
    use crate::store::StoreConfig;
    use crate::types::RecordInput;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn test_store(dir: &TempDir) -> Arc<Store> {
        Arc::new(
            Store::create(StoreConfig {
                path: dir.path().join("store"),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn tasks_query() -> Arc<Query> {
        Arc::new(
            Query::new(Predicate::record_type("task"))
                .sorted_by(SortDescriptor::ascending("list"))
                .sorted_by(SortDescriptor::ascending("title"))
                .sectioned_by("list"),
        )
    }

    fn task(list: &str, title: &str) -> RecordInput {
        RecordInput::json("task", &json!({"list": list, "title": title})).unwrap()
    }

    fn counting(handle: &LiveQuery) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        handle.on_change(Box::new(move |notice: ChangeNotice| {
            if let ChangeNotice::Changed = notice {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));
        calls
    }

    #[test]
    fn test_no_snapshot_before_fetch() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let handle = store.observe(&tasks_query());

        assert!(handle.current_flat_results().is_none());
        assert!(handle.current_sections().is_none());
        assert_eq!(store.stats().observer_count, 0);
    }

    #[test]
    fn test_initial_fetch_builds_sections() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.insert(task("home", "laundry")).unwrap();
        store.insert(task("work", "report")).unwrap();
        store.insert(task("home", "dishes")).unwrap();

        let handle = store.observe(&tasks_query());
        handle.perform_initial_fetch().unwrap();

        let sections = handle.current_sections().unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].name.as_deref(), Some("home"));
        assert_eq!(sections[0].records.len(), 2);
        assert_eq!(handle.current_flat_results().unwrap().len(), 3);
        assert_eq!(store.stats().observer_count, 1);
    }

    #[test]
    fn test_flat_query_has_no_sections() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let query = Arc::new(
            Query::new(Predicate::record_type("task")).sorted_by(SortDescriptor::ascending("title")),
        );

        let handle = store.observe(&query);
        handle.perform_initial_fetch().unwrap();
        assert!(handle.current_sections().is_none());
        assert!(handle.current_flat_results().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_query_fails_initial_fetch() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let handle = store.observe(&Arc::new(Query::new(Predicate::All)));

        assert!(matches!(
            handle.perform_initial_fetch(),
            Err(StoreError::InvalidQuery(_))
        ));
        assert_eq!(store.stats().observer_count, 0);
    }

    #[test]
    fn test_change_callback_only_for_relevant_changes() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let handle = store.observe(&tasks_query());
        let calls = counting(&handle);
        handle.perform_initial_fetch().unwrap();

        store
            .insert(RecordInput::json("note", &json!({"text": "unrelated"})).unwrap())
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let record = store.insert(task("home", "vacuum")).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.current_flat_results().unwrap().len(), 1);

        // Moving a record out of the result set is relevant too
        store
            .update(record.id, RecordInput::json("note", &json!({})).unwrap())
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(handle.current_flat_results().unwrap().is_empty());
    }

    #[test]
    fn test_stop_detaches_from_store() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let handle = store.observe(&tasks_query());
        let calls = counting(&handle);
        handle.perform_initial_fetch().unwrap();

        handle.stop();
        handle.stop();
        assert_eq!(store.stats().observer_count, 0);
        assert!(handle.current_flat_results().is_none());

        store.insert(task("home", "vacuum")).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            handle.perform_initial_fetch(),
            Err(StoreError::Closed)
        ));
    }

    #[test]
    fn test_store_close_reports_failure() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let handle = store.observe(&tasks_query());
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&failures);
        handle.on_change(Box::new(move |notice: ChangeNotice| {
            if let ChangeNotice::Failed(error) = notice {
                sink.lock().push(error.to_string());
            }
        }));
        handle.perform_initial_fetch().unwrap();

        store.close().unwrap();
        assert_eq!(*failures.lock(), vec![StoreError::Closed.to_string()]);
    }

    #[test]
    fn test_drop_unregisters_observer() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        {
            let handle = store.observe(&tasks_query());
            handle.perform_initial_fetch().unwrap();
            assert_eq!(store.stats().observer_count, 1);
        }
        assert_eq!(store.stats().observer_count, 0);
    }

    #[test]
    fn test_catch_up_after_initial_fetch_is_silent() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.insert(task("inbox", "a")).unwrap();

        let handle = store.observe(&tasks_query());
        let calls = counting(&handle);
        handle.register_observer().unwrap();

        // A write lands between the fetch and installing its result
        let stale = store.fetch_snapshot(&tasks_query()).unwrap();
        store.insert(task("inbox", "b")).unwrap();
        handle.inner.install_initial(stale);

        assert_eq!(handle.current_flat_results().unwrap().len(), 2);
        assert_eq!(handle.snapshot_sequence(), Some(store.sequence()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Later commits still notify
        store.insert(task("inbox", "c")).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
