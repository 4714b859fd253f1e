//! Main Store struct tying all components together.

use crate::error::{Result, StoreError};
use crate::notify::{ChangeFeed, ChangeNotifier, ChangeObserver, ObserverId, StoreEvent};
use crate::observation::RawSection;
use crate::query::{self, Query};
use crate::records::{LogEntry, RecordLog, RecordTable};
use crate::types::{Change, ChangeSet, Record, RecordId, RecordInput, Sequence, StoreStats, Timestamp};
use fs2::FileExt;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Query cache size (number of cache names kept).
    pub query_cache_size: usize,

    /// Sync the log every N writes.
    pub sync_interval: u64,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./store"),
            query_cache_size: 64,
            sync_interval: RecordLog::DEFAULT_SYNC_INTERVAL,
            create_if_missing: true,
        }
    }
}

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"LQS\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// Result of a fetch remembered under a query's cache name.
struct CachedFetch {
    fingerprint: String,
    sequence: Sequence,
    ids: Vec<RecordId>,
}

/// Ordered query result together with the store sequence it reflects.
#[derive(Clone, Debug)]
pub struct QuerySnapshot {
    pub sequence: Sequence,
    pub records: Vec<Record>,
}

/// The persistent record store.
///
/// Provides a unified interface for:
/// - Inserting, updating and deleting records
/// - Executing queries (with optional named result caches)
/// - Observing committed changes
pub struct Store {
    /// Store configuration.
    config: StoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Append-only log of writes.
    log: RecordLog,

    /// Latest version of every live record.
    table: RwLock<RecordTable>,

    /// Named query results.
    query_cache: Mutex<LruCache<String, CachedFetch>>,

    /// Number of fetches answered from the query cache.
    cache_hits: AtomicU64,

    /// Observers of committed writes.
    notifier: ChangeNotifier,

    /// Lock for write operations to ensure atomicity.
    write_lock: Mutex<()>,

    closed: AtomicBool,
}

impl Store {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        if config.path.exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;

        let lock_file = Self::acquire_lock(&config.path)?;
        let log = RecordLog::open_with_sync_interval(
            config.path.join("records.log"),
            config.sync_interval,
        )?;

        Ok(Self::assemble(config, lock_file, log, RecordTable::new()))
    }

    /// Open an existing store, replaying its log.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;

        let lock_file = Self::acquire_lock(&config.path)?;
        let log = RecordLog::open_with_sync_interval(
            config.path.join("records.log"),
            config.sync_interval,
        )?;
        let table = RecordTable::from_entries(log.replay()?);

        tracing::debug!(
            path = %config.path.display(),
            records = table.len(),
            sequence = table.sequence().0,
            "opened store"
        );

        Ok(Self::assemble(config, lock_file, log, table))
    }

    fn assemble(config: StoreConfig, lock_file: File, log: RecordLog, table: RecordTable) -> Self {
        let cache_size = NonZeroUsize::new(config.query_cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        Self {
            config,
            _lock_file: lock_file,
            log,
            table: RwLock::new(table),
            query_cache: Mutex::new(LruCache::new(cache_size)),
            cache_hits: AtomicU64::new(0),
            notifier: ChangeNotifier::new(),
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    // --- Record Operations ---

    /// Insert a new record.
    pub fn insert(&self, input: RecordInput) -> Result<Record> {
        let record = self.commit(|table| {
            let record = Record {
                id: table.next_id(),
                sequence: table.sequence().next(),
                timestamp: Timestamp::now(),
                record_type: input.record_type,
                payload: input.payload,
                encoding: input.encoding,
            };
            Ok((LogEntry::Put(record.clone()), record))
        })?;
        Ok(record)
    }

    /// Replace the content of an existing record.
    pub fn update(&self, id: RecordId, input: RecordInput) -> Result<Record> {
        self.commit(|table| {
            if table.get(id).is_none() {
                return Err(StoreError::RecordNotFound(id));
            }
            let record = Record {
                id,
                sequence: table.sequence().next(),
                timestamp: Timestamp::now(),
                record_type: input.record_type,
                payload: input.payload,
                encoding: input.encoding,
            };
            Ok((LogEntry::Put(record.clone()), record))
        })
    }

    /// Delete a record. Returns the removed version, or `None` if it did not
    /// exist (nothing is written in that case).
    pub fn delete(&self, id: RecordId) -> Result<Option<Record>> {
        let result = self.commit(|table| match table.get(id) {
            Some(existing) => {
                let entry = LogEntry::Delete {
                    id,
                    sequence: table.sequence().next(),
                };
                Ok((entry, existing.clone()))
            }
            None => Err(StoreError::RecordNotFound(id)),
        });

        match result {
            Ok(removed) => Ok(Some(removed)),
            Err(StoreError::RecordNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Log and apply one write, then notify observers outside all locks.
    fn commit<T>(
        &self,
        prepare: impl FnOnce(&RecordTable) -> Result<(LogEntry, T)>,
    ) -> Result<T> {
        self.ensure_open()?;

        let (changes, value) = {
            let _lock = self.write_lock.lock();
            let mut table = self.table.write();

            let (entry, value) = prepare(&*table)?;
            let sequence = entry.sequence();
            self.log.append(&entry)?;

            let change = match (&entry, table.apply(entry.clone())) {
                (LogEntry::Put(after), Some(before)) => Change::Updated {
                    before,
                    after: after.clone(),
                },
                (LogEntry::Put(record), None) => Change::Inserted {
                    record: record.clone(),
                },
                (LogEntry::Delete { .. }, Some(record)) => Change::Deleted { record },
                (LogEntry::Delete { id, .. }, None) => {
                    return Err(StoreError::Corruption(format!(
                        "deleted record {} missing from table",
                        id
                    )))
                }
            };

            tracing::trace!(sequence = sequence.0, "committed write");
            (
                ChangeSet {
                    sequence,
                    changes: vec![change],
                },
                value,
            )
        };

        self.notifier.broadcast(&StoreEvent::Committed(changes));
        Ok(value)
    }

    /// Get a record by ID.
    pub fn get_record(&self, id: RecordId) -> Result<Option<Record>> {
        self.ensure_open()?;
        Ok(self.table.read().get(id).cloned())
    }

    /// Get live record IDs by type.
    pub fn records_by_type(&self, record_type: &str) -> Vec<RecordId> {
        self.table.read().by_type(record_type)
    }

    // --- Query Operations ---

    /// Execute a query and return the ordered result.
    pub fn fetch(&self, query: &Query) -> Result<Vec<Record>> {
        Ok(self.fetch_snapshot(query)?.records)
    }

    /// Execute a query and group the result into sections.
    pub fn fetch_sections(&self, query: &Query) -> Result<Vec<RawSection<Record>>> {
        let snapshot = self.fetch_snapshot(query)?;
        Ok(query::group_sections(query, &snapshot.records))
    }

    /// Execute a query, reporting the sequence the result reflects.
    ///
    /// Queries with a cache name reuse the previous ordering when nothing was
    /// committed since it was computed.
    pub fn fetch_snapshot(&self, query: &Query) -> Result<QuerySnapshot> {
        self.ensure_open()?;
        query.validate()?;

        let table = self.table.read();
        let sequence = table.sequence();

        let cache_name = match query.cache_name {
            Some(ref name) => name,
            None => {
                return Ok(QuerySnapshot {
                    sequence,
                    records: query::execute(query, table.iter()),
                })
            }
        };

        let fingerprint = query.fingerprint();
        let mut cache = self.query_cache.lock();

        if let Some(cached) = cache.get(cache_name) {
            if cached.sequence == sequence && cached.fingerprint == fingerprint {
                let records = cached
                    .ids
                    .iter()
                    .filter_map(|id| table.get(*id).cloned())
                    .collect();
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(QuerySnapshot { sequence, records });
            }
        }

        let records = query::execute(query, table.iter());
        cache.put(
            cache_name.clone(),
            CachedFetch {
                fingerprint,
                sequence,
                ids: records.iter().map(|r| r.id).collect(),
            },
        );

        Ok(QuerySnapshot { sequence, records })
    }

    /// Drop a named query cache, or every cache when `name` is `None`.
    pub fn delete_cache(&self, name: Option<&str>) {
        let mut cache = self.query_cache.lock();
        match name {
            Some(name) => {
                cache.pop(name);
            }
            None => cache.clear(),
        }
    }

    // --- Observation ---

    /// Register a callback run after every committed write and on close.
    pub fn add_observer(&self, callback: ChangeObserver) -> Result<ObserverId> {
        self.ensure_open()?;
        Ok(self.notifier.observe(callback))
    }

    /// Unregister an observer.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.notifier.remove(id)
    }

    /// Open a buffered feed of store events.
    pub fn change_feed(&self, buffer_size: usize) -> Result<ChangeFeed> {
        self.ensure_open()?;
        Ok(self.notifier.feed(buffer_size))
    }

    // --- Maintenance ---

    /// Get store statistics.
    pub fn stats(&self) -> StoreStats {
        let table = self.table.read();
        StoreStats {
            record_count: table.len() as u64,
            log_size_bytes: self.log.size(),
            sequence: table.sequence(),
            observer_count: self.notifier.observer_count(),
            query_cache_hits: self.cache_hits.load(Ordering::Relaxed),
        }
    }

    /// Current commit sequence.
    pub fn sequence(&self) -> Sequence {
        self.table.read().sequence()
    }

    /// Force sync pending log writes.
    pub fn sync(&self) -> Result<()> {
        self.log.sync()
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Close the store. Observers receive [`StoreEvent::Closed`] and are
    /// dropped; later reads, writes and fetches fail with
    /// [`StoreError::Closed`].
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.notifier.broadcast(&StoreEvent::Closed);
        self.notifier.clear();
        self.delete_cache(None);
        self.sync()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // --- Private Helpers ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::create(manifest_path)?;

        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Predicate, SortDescriptor};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> StoreConfig {
        StoreConfig {
            path: dir.path().join("store"),
            query_cache_size: 8,
            sync_interval: 1,
            create_if_missing: true,
        }
    }

    fn task(title: &str, status: &str) -> RecordInput {
        RecordInput::json("task", &json!({"title": title, "status": status})).unwrap()
    }

    fn by_title() -> Query {
        Query::new(Predicate::record_type("task")).sorted_by(SortDescriptor::ascending("title"))
    }

    #[test]
    fn test_create_store() {
        let dir = TempDir::new().unwrap();
        let store = Store::create(test_config(&dir)).unwrap();

        assert!(store.path().join("MANIFEST").exists());
        assert!(store.path().join("records.log").exists());
        assert!(store.path().join("LOCK").exists());
    }

    #[test]
    fn test_insert_update_delete() {
        let dir = TempDir::new().unwrap();
        let store = Store::create(test_config(&dir)).unwrap();

        let first = store.insert(task("a", "open")).unwrap();
        assert_eq!(first.id, RecordId(1));
        assert_eq!(first.sequence, Sequence(1));

        let updated = store.update(first.id, task("a", "done")).unwrap();
        assert_eq!(updated.id, first.id);
        assert_eq!(updated.sequence, Sequence(2));
        assert_eq!(
            store.get_record(first.id).unwrap().unwrap().json().unwrap()["status"],
            "done"
        );

        let removed = store.delete(first.id).unwrap().unwrap();
        assert_eq!(removed.sequence, Sequence(2));
        assert!(store.get_record(first.id).unwrap().is_none());
        assert!(store.delete(first.id).unwrap().is_none());
        assert_eq!(store.sequence(), Sequence(3));
    }

    #[test]
    fn test_update_missing_record() {
        let dir = TempDir::new().unwrap();
        let store = Store::create(test_config(&dir)).unwrap();

        let result = store.update(RecordId(99), task("x", "open"));
        assert!(matches!(result, Err(StoreError::RecordNotFound(RecordId(99)))));
        assert_eq!(store.sequence(), Sequence(0));
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        {
            let store = Store::create(config.clone()).unwrap();
            store.insert(task("b", "open")).unwrap();
            let a = store.insert(task("a", "open")).unwrap();
            store.insert(task("c", "open")).unwrap();
            store.delete(a.id).unwrap();
        }

        let store = Store::open(config).unwrap();
        let titles: Vec<_> = store
            .fetch(&by_title())
            .unwrap()
            .iter()
            .map(|r| r.json().unwrap()["title"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(titles, vec!["b", "c"]);
        assert_eq!(store.sequence(), Sequence(4));

        // Ids continue after the highest assigned
        let next = store.insert(task("d", "open")).unwrap();
        assert_eq!(next.id, RecordId(4));
    }

    #[test]
    fn test_store_lock() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let _store = Store::create(config.clone()).unwrap();
        let second = Store::open(config);
        assert!(matches!(second, Err(StoreError::Locked)));
    }

    #[test]
    fn test_open_missing_without_create() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            create_if_missing: false,
            ..test_config(&dir)
        };
        assert!(matches!(
            Store::open_or_create(config),
            Err(StoreError::NotInitialized)
        ));
    }

    #[test]
    fn test_fetch_sections() {
        let dir = TempDir::new().unwrap();
        let store = Store::create(test_config(&dir)).unwrap();

        store.insert(task("write", "open")).unwrap();
        store.insert(task("ship", "done")).unwrap();
        store.insert(task("plan", "open")).unwrap();

        let query = Query::new(Predicate::record_type("task"))
            .sorted_by(SortDescriptor::ascending("status"))
            .sorted_by(SortDescriptor::ascending("title"))
            .sectioned_by("status");
        let sections = store.fetch_sections(&query).unwrap();

        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].name.as_deref(), Some("done"));
        assert_eq!(sections[0].index_title.as_deref(), Some("D"));
        assert_eq!(sections[1].name.as_deref(), Some("open"));
        assert_eq!(sections[1].records.len(), 2);
    }

    #[test]
    fn test_invalid_query_fails_fetch() {
        let dir = TempDir::new().unwrap();
        let store = Store::create(test_config(&dir)).unwrap();

        let unsorted = Query::new(Predicate::All);
        assert!(matches!(
            store.fetch(&unsorted),
            Err(StoreError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_query_cache_reuse_and_invalidation() {
        let dir = TempDir::new().unwrap();
        let store = Store::create(test_config(&dir)).unwrap();
        store.insert(task("a", "open")).unwrap();

        let query = by_title().cached_as("tasks");
        assert_eq!(store.fetch(&query).unwrap().len(), 1);
        assert_eq!(store.stats().query_cache_hits, 0);

        assert_eq!(store.fetch(&query).unwrap().len(), 1);
        assert_eq!(store.stats().query_cache_hits, 1);

        // A commit moves the sequence, so the cache is stale
        store.insert(task("b", "open")).unwrap();
        assert_eq!(store.fetch(&query).unwrap().len(), 2);
        assert_eq!(store.stats().query_cache_hits, 1);

        // Same cache name, different query: not reused
        let other = Query::new(Predicate::equals("title", "a"))
            .sorted_by(SortDescriptor::ascending("title"))
            .cached_as("tasks");
        assert_eq!(store.fetch(&other).unwrap().len(), 1);
        assert_eq!(store.stats().query_cache_hits, 1);

        store.delete_cache(Some("tasks"));
        assert_eq!(store.fetch(&other).unwrap().len(), 1);
        assert_eq!(store.stats().query_cache_hits, 1);
    }

    #[test]
    fn test_observers_see_committed_changes() {
        let dir = TempDir::new().unwrap();
        let store = Store::create(test_config(&dir)).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store
            .add_observer(Arc::new(move |event: &StoreEvent| {
                if let StoreEvent::Committed(changes) = event {
                    sink.lock().push(changes.clone());
                }
            }))
            .unwrap();

        let record = store.insert(task("a", "open")).unwrap();
        store.update(record.id, task("a", "done")).unwrap();
        store.delete(record.id).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert!(matches!(seen[0].changes[0], Change::Inserted { .. }));
        assert!(matches!(seen[1].changes[0], Change::Updated { .. }));
        assert!(matches!(seen[2].changes[0], Change::Deleted { .. }));
        assert_eq!(seen[2].sequence, Sequence(3));
    }

    #[test]
    fn test_close() {
        let dir = TempDir::new().unwrap();
        let store = Store::create(test_config(&dir)).unwrap();
        let feed = store.change_feed(4).unwrap();

        store.close().unwrap();
        assert!(matches!(feed.try_recv(), Ok(StoreEvent::Closed)));
        assert!(store.is_closed());
        assert_eq!(store.stats().observer_count, 0);
        assert!(matches!(store.insert(task("a", "open")), Err(StoreError::Closed)));
        assert!(matches!(store.fetch(&by_title()), Err(StoreError::Closed)));
        // Closing twice is fine
        store.close().unwrap();
    }
}
