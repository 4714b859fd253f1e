//! End-to-end tests for live result streams over a real store.

use livequery::{
    Demand, Predicate, Query, Record, RecordInput, ResultStream, SectionedResult, Sink,
    SortDescriptor, Store, StoreConfig, StreamEvent, SubscriptionConfig, SubscriptionStatus,
    ValueMapper,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Task {
    list: String,
    title: String,
    #[serde(default)]
    done: bool,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn test_store(dir: &TempDir) -> Arc<Store> {
    init_tracing();
    Arc::new(
        Store::create(StoreConfig {
            path: dir.path().join("store"),
            ..Default::default()
        })
        .unwrap(),
    )
}

fn task(list: &str, title: &str) -> RecordInput {
    RecordInput::json("task", &json!({"list": list, "title": title})).unwrap()
}

fn board_query() -> Query {
    Query::new(Predicate::record_type("task"))
        .sorted_by(SortDescriptor::ascending("list"))
        .sorted_by(SortDescriptor::ascending("title"))
        .sectioned_by("list")
}

fn board(sections: &SectionedResult<Task>) -> Vec<(String, Vec<String>)> {
    sections
        .iter()
        .map(|section| {
            (
                section.name.clone().unwrap_or_default(),
                section.values.iter().map(|t| t.title.clone()).collect(),
            )
        })
        .collect()
}

fn next_value<T>(event: StreamEvent<T>) -> T {
    match event {
        StreamEvent::Value(value) => value,
        StreamEvent::Failed(error) => panic!("Expected value, got failure: {}", error),
    }
}

// --- Realistic Workflow Tests ---

#[test]
fn test_task_board_follows_edits() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    store.insert(task("inbox", "call bank")).unwrap();
    let groceries = store.insert(task("inbox", "groceries")).unwrap();
    store.insert(task("work", "review")).unwrap();

    let stream = ResultStream::sectioned(
        Arc::clone(&store),
        board_query(),
        ValueMapper::<Record, Task>::json(),
    );
    let subscription = stream.subscribe_channel();
    subscription.request(Demand::unlimited());

    let initial = next_value(subscription.recv_timeout(WAIT).unwrap());
    assert_eq!(
        board(&initial),
        vec![
            ("inbox".to_string(), vec!["call bank".to_string(), "groceries".to_string()]),
            ("work".to_string(), vec!["review".to_string()]),
        ]
    );
    assert_eq!(initial[0].index_title.as_deref(), Some("I"));

    // Move a task to another list
    store.update(groceries.id, task("home", "groceries")).unwrap();
    let moved = next_value(subscription.recv_timeout(WAIT).unwrap());
    let names: Vec<String> = board(&moved).into_iter().map(|(name, _)| name).collect();
    assert_eq!(names, vec!["home", "inbox", "work"]);

    // Emptying a list removes its section
    store.delete(groceries.id).unwrap();
    let deleted = next_value(subscription.recv_timeout(WAIT).unwrap());
    assert_eq!(deleted.len(), 2);
    assert_eq!(deleted[0].name.as_deref(), Some("inbox"));

    subscription.cancel();
}

#[test]
fn test_malformed_records_are_skipped() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    store.insert(task("inbox", "a")).unwrap();
    store
        .insert(RecordInput::raw("task", b"not json".to_vec()))
        .unwrap();
    store
        .insert(RecordInput::json("task", &json!({"title": "no list"})).unwrap())
        .unwrap();
    store.insert(task("inbox", "b")).unwrap();

    let query = Query::new(Predicate::record_type("task")).sorted_by(SortDescriptor::ascending("title"));
    let stream = ResultStream::flat(Arc::clone(&store), query, ValueMapper::<Record, Task>::json());
    let subscription = stream.subscribe_channel();

    let tasks = next_value(subscription.next_timeout(WAIT).unwrap());
    let titles: Vec<&str> = tasks.iter().map(|t| t.title.as_str()).collect();
    assert_eq!(titles, vec!["a", "b"]);
}

#[test]
fn test_subscriptions_are_independent() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let stream = ResultStream::sectioned(
        Arc::clone(&store),
        board_query(),
        ValueMapper::<Record, Task>::json(),
    );

    let eager = stream.subscribe_channel();
    let lazy = stream.subscribe_channel();
    eager.request(Demand::unlimited());
    next_value(eager.recv_timeout(WAIT).unwrap());

    store.insert(task("inbox", "a")).unwrap();
    store.insert(task("inbox", "b")).unwrap();

    assert_eq!(next_value(eager.recv_timeout(WAIT).unwrap())[0].len(), 1);
    assert_eq!(next_value(eager.recv_timeout(WAIT).unwrap())[0].len(), 2);
    assert!(lazy.try_recv().is_err());
    assert_eq!(lazy.status(), SubscriptionStatus::WaitingForDemand);

    // The lazy subscription catches up with one fresh fetch
    let sections = next_value(lazy.next_timeout(WAIT).unwrap());
    assert_eq!(sections[0].len(), 2);
    assert_eq!(lazy.subscription().handles_created(), 1);
}

#[test]
fn test_stream_over_reopened_store() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig {
        path: dir.path().join("store"),
        ..Default::default()
    };

    {
        let store = Store::create(config.clone()).unwrap();
        store.insert(task("inbox", "persisted")).unwrap();
        store.sync().unwrap();
    }

    let store = Arc::new(Store::open(config).unwrap());
    let stream = ResultStream::flat(
        Arc::clone(&store),
        board_query().cached_as("board"),
        ValueMapper::<Record, Task>::json(),
    )
    .with_config(SubscriptionConfig::default().with_label("board"));
    let subscription = stream.subscribe_channel();

    let tasks = next_value(subscription.next_timeout(WAIT).unwrap());
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].title, "persisted");
    assert!(!tasks[0].done);

    // Same query name and sequence: served from the cache
    let again = next_value(subscription.next_timeout(WAIT).unwrap());
    assert_eq!(again, tasks);
    assert!(store.stats().query_cache_hits >= 1);
}

#[test]
fn test_consumer_thread_pulls_one_at_a_time() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let query = Query::new(Predicate::record_type("task")).sorted_by(SortDescriptor::ascending("title"));
    let stream = ResultStream::flat(Arc::clone(&store), query, ValueMapper::<Record, Task>::json());
    let subscription = stream.subscribe_channel();

    subscription.request(Demand::max(1));
    assert!(next_value(subscription.recv_timeout(WAIT).unwrap()).is_empty());
    assert_eq!(subscription.status(), SubscriptionStatus::WaitingForDemand);

    let consumer = thread::spawn(move || {
        let mut sizes = Vec::new();
        while sizes.last() != Some(&5) {
            let tasks = next_value(subscription.next_timeout(WAIT).unwrap());
            sizes.push(tasks.len());
            if sizes.len() > 5000 {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        sizes
    });

    for i in 0..5 {
        store.insert(task("inbox", &format!("t{}", i))).unwrap();
        thread::sleep(Duration::from_millis(2));
    }

    let sizes = consumer.join().unwrap();
    assert_eq!(sizes.last(), Some(&5));
    assert!(sizes.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_sink_controls_its_own_pace() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let seen: Arc<Mutex<Vec<usize>>> = Arc::default();

    let sink = Arc::clone(&seen);
    let stream = ResultStream::sectioned(
        Arc::clone(&store),
        board_query(),
        ValueMapper::<Record, Task>::json(),
    );
    // Accept three snapshots in total, one at a time
    let subscription = stream.subscribe(Sink::new(move |sections: SectionedResult<Task>| {
        let mut seen = sink.lock();
        seen.push(sections.iter().map(|s| s.len()).sum());
        if seen.len() < 3 {
            Demand::max(1)
        } else {
            Demand::none()
        }
    }));

    subscription.request(Demand::max(1));
    for title in ["a", "b", "c", "d"] {
        store.insert(task("inbox", title)).unwrap();
    }

    assert_eq!(*seen.lock(), vec![0, 1, 2]);
    assert_eq!(subscription.status(), SubscriptionStatus::WaitingForDemand);
    assert_eq!(store.stats().observer_count, 0);
}
