//! # Live Query
//!
//! Demand-driven live query subscriptions over a persistent record store.
//!
//! A consumer subscribes to the result set of a query, optionally grouped into
//! named sections, and receives a fresh snapshot every time the store changes,
//! at the pace it controls through explicit demand.
//!
//! ## Core Concepts
//!
//! - **Store**: Append-only record log with an in-memory table, queries and
//!   change notification
//! - **Observation**: Live handles tracking one query's result set
//! - **Demand**: Backpressure; one unit buys one emitted snapshot
//! - **Streams**: Subscriptions that observe only while demand remains
//!
//! ## Example
//!
//! ```ignore
//! use livequery::{Demand, Query, Predicate, ResultStream, SortDescriptor, Store, StoreConfig, ValueMapper};
//! use std::sync::Arc;
//!
//! let store = Arc::new(Store::open_or_create(StoreConfig {
//!     path: "./my-store".into(),
//!     ..Default::default()
//! })?);
//!
//! let query = Query::new(Predicate::record_type("task"))
//!     .sorted_by(SortDescriptor::ascending("list"))
//!     .sectioned_by("list");
//!
//! let stream = ResultStream::sectioned(Arc::clone(&store), query, ValueMapper::<_, Task>::json());
//! let subscription = stream.subscribe_channel();
//!
//! // First snapshot, fetched on demand
//! subscription.request(Demand::max(1));
//! let sections = subscription.recv()?;
//! ```

pub mod demand;
pub mod error;
pub mod machine;
pub mod mapper;
pub mod notify;
pub mod observation;
pub mod query;
pub mod records;
pub mod section;
pub mod store;
pub mod stream;
pub mod subscriber;
pub mod types;

// Re-exports
pub use demand::Demand;
pub use error::{Result, StoreError};
pub use machine::{
    Flat, MissingSnapshotPolicy, ResultShape, Sectioned, Signal, SubscriptionConfig,
    SubscriptionId, SubscriptionState, SubscriptionStateMachine, SubscriptionStatus,
};
pub use mapper::ValueMapper;
pub use notify::{ChangeFeed, ChangeNotifier, ObserverId, StoreEvent};
pub use observation::{
    ChangeCallback, ChangeNotice, LiveQuery, ObservationHandle, ObservationSource, RawSection,
};
pub use query::{KeyPath, Predicate, Query, SortDescriptor};
pub use records::{LogEntry, RecordLog, RecordTable};
pub use section::{Section, SectionedResult};
pub use store::{QuerySnapshot, Store, StoreConfig};
pub use stream::{ChannelSubscription, ResultStream, Subscription};
pub use subscriber::{ChannelSubscriber, Sink, StreamEvent, Subscriber};
pub use types::{
    Change, ChangeSet, PayloadEncoding, Record, RecordId, RecordInput, Sequence, StoreStats,
    Timestamp,
};
