//! Subscription state machine.
//!
//! One [`SubscriptionStateMachine`] drives the demand protocol of one
//! subscription: it creates an observation handle on the first positive
//! demand, turns change notifications into emissions while demand remains,
//! goes cold (stops the handle) when demand reaches zero, and tears down on
//! cancellation or terminal failure.
//!
//! The machine itself is not thread safe. Callers serialize every entry
//! point; [`ResultStream`](crate::ResultStream) does so with a mailbox.
//! Handle callbacks never call into the machine directly: they are turned
//! into [`Signal`]s and handed to the [`SignalForwarder`].

use crate::demand::Demand;
use crate::error::StoreError;
use crate::mapper::ValueMapper;
use crate::observation::{ChangeNotice, ObservationHandle, ObservationSource};
use crate::query::Query;
use crate::section::{Section, SectionedResult};
use crate::subscriber::Subscriber;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

/// Process-unique subscription identifier, used in log fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl SubscriptionId {
    fn next() -> Self {
        SubscriptionId(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What to do when a handle reports a successful fetch but exposes neither
/// sections nor a flat result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingSnapshotPolicy {
    /// Log at error level and emit an empty result.
    #[default]
    EmitEmpty,
    /// Fail the subscription with [`StoreError::InvariantViolation`].
    Fail,
}

/// Per-subscription settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Free-form name included in log fields.
    pub label: Option<String>,
    pub missing_snapshot: MissingSnapshotPolicy,
}

impl SubscriptionConfig {
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_missing_snapshot(mut self, policy: MissingSnapshotPolicy) -> Self {
        self.missing_snapshot = policy;
        self
    }
}

/// Input to the state machine. Change and failure signals carry the
/// generation of the handle they came from.
#[derive(Debug)]
pub enum Signal {
    Request(Demand),
    Cancel,
    Changed(u64),
    Failed(u64, StoreError),
}

/// Where handle callbacks send their signals.
pub type SignalForwarder = Arc<dyn Fn(Signal) + Send + Sync>;

/// State of one subscription. Exactly one holds at any time.
pub enum SubscriptionState<H> {
    WaitingForDemand,
    Observing {
        handle: H,
        demand: Demand,
        /// Ordinal of `handle` among the handles this subscription created.
        generation: u64,
    },
    Completed,
    Cancelled,
}

/// Observable summary of a [`SubscriptionState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionStatus {
    WaitingForDemand,
    Observing { demand: Demand },
    Completed,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SubscriptionStatus::Completed | SubscriptionStatus::Cancelled)
    }
}

impl<H> SubscriptionState<H> {
    pub fn status(&self) -> SubscriptionStatus {
        match self {
            SubscriptionState::WaitingForDemand => SubscriptionStatus::WaitingForDemand,
            SubscriptionState::Observing { demand, .. } => {
                SubscriptionStatus::Observing { demand: *demand }
            }
            SubscriptionState::Completed => SubscriptionStatus::Completed,
            SubscriptionState::Cancelled => SubscriptionStatus::Cancelled,
        }
    }
}

/// How a handle snapshot becomes an emitted value.
pub trait ResultShape<R, O>: Send + Sync + 'static {
    type Output: Send + 'static;

    /// Map the handle's current snapshot, or `None` if it exposes nothing.
    fn project<H>(handle: &H, mapper: &ValueMapper<R, O>) -> Option<Self::Output>
    where
        H: ObservationHandle<Record = R>;

    fn empty() -> Self::Output;
}

/// Emits `Vec<O>`: the flat result, or the sections concatenated in order.
pub struct Flat;

/// Emits [`SectionedResult<O>`]: the sections, or the flat result as one
/// unnamed section.
pub struct Sectioned;

impl<R, O: Send + 'static> ResultShape<R, O> for Flat {
    type Output = Vec<O>;

    fn project<H>(handle: &H, mapper: &ValueMapper<R, O>) -> Option<Vec<O>>
    where
        H: ObservationHandle<Record = R>,
    {
        if let Some(records) = handle.current_flat_results() {
            return Some(mapper.map_all(&records));
        }
        handle.current_sections().map(|sections| {
            sections
                .iter()
                .flat_map(|section| section.records.iter())
                .filter_map(|record| mapper.map(record))
                .collect()
        })
    }

    fn empty() -> Vec<O> {
        Vec::new()
    }
}

impl<R, O: Send + 'static> ResultShape<R, O> for Sectioned {
    type Output = SectionedResult<O>;

    fn project<H>(handle: &H, mapper: &ValueMapper<R, O>) -> Option<SectionedResult<O>>
    where
        H: ObservationHandle<Record = R>,
    {
        if let Some(sections) = handle.current_sections() {
            return Some(
                sections
                    .iter()
                    .map(|raw| Section::from_raw(raw, mapper))
                    .collect(),
            );
        }
        handle
            .current_flat_results()
            .map(|records| vec![Section::unnamed(mapper.map_all(&records))])
    }

    fn empty() -> SectionedResult<O> {
        Vec::new()
    }
}

/// Demand-driven bridge between one observation source and one subscriber.
pub struct SubscriptionStateMachine<S, O, P>
where
    S: ObservationSource,
    P: ResultShape<S::Record, O>,
{
    id: SubscriptionId,
    source: S,
    query: Arc<Query>,
    mapper: ValueMapper<S::Record, O>,
    config: SubscriptionConfig,
    state: SubscriptionState<S::Handle>,
    /// Dropped on entering a terminal state.
    subscriber: Option<Box<dyn Subscriber<P::Output>>>,
    forward: SignalForwarder,
    cancelled: Arc<AtomicBool>,
    generation: u64,
    _shape: PhantomData<fn() -> P>,
}

impl<S, O, P> SubscriptionStateMachine<S, O, P>
where
    S: ObservationSource,
    P: ResultShape<S::Record, O>,
{
    pub fn new(
        source: S,
        query: Arc<Query>,
        mapper: ValueMapper<S::Record, O>,
        subscriber: Box<dyn Subscriber<P::Output>>,
        config: SubscriptionConfig,
    ) -> Self {
        Self {
            id: SubscriptionId::next(),
            source,
            query,
            mapper,
            config,
            state: SubscriptionState::WaitingForDemand,
            subscriber: Some(subscriber),
            forward: Arc::new(|_: Signal| {}),
            cancelled: Arc::new(AtomicBool::new(false)),
            generation: 0,
            _shape: PhantomData,
        }
    }

    /// Route handle callbacks to `forward`. Until set they are dropped.
    pub fn with_forwarder(mut self, forward: SignalForwarder) -> Self {
        self.forward = forward;
        self
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.state.status()
    }

    /// Number of observation handles created so far.
    pub fn handles_created(&self) -> u64 {
        self.generation
    }

    /// Flag that cancels the subscription as soon as it is set, without
    /// waiting for the machine to process [`Signal::Cancel`].
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn label(&self) -> &str {
        self.config.label.as_deref().unwrap_or("")
    }

    pub fn process(&mut self, signal: Signal) {
        match signal {
            Signal::Request(demand) => self.request_demand(demand),
            Signal::Cancel => self.cancel(),
            Signal::Changed(generation) => self.handle_change(generation),
            Signal::Failed(generation, error) => self.handle_failure(generation, error),
        }
    }

    /// Add demand. The first positive demand while waiting starts observing
    /// and emits the initial snapshot.
    pub fn request_demand(&mut self, additional: Demand) {
        if self.is_cancelled() {
            self.enter_cancelled();
            return;
        }

        if let SubscriptionState::Observing { demand, .. } = &mut self.state {
            *demand += additional;
            tracing::trace!(subscription = %self.id, demand = %demand, "demand accumulated");
            return;
        }

        if matches!(self.state, SubscriptionState::WaitingForDemand) && !additional.is_zero() {
            self.start_observing(additional);
        }
    }

    /// Cancel from any state. Idempotent.
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        self.enter_cancelled();
    }

    /// Change notification from the handle of `generation`.
    pub fn handle_change(&mut self, generation: u64) {
        if self.is_cancelled() {
            self.enter_cancelled();
            return;
        }
        if self.is_current(generation) {
            self.deliver();
        } else {
            tracing::trace!(
                subscription = %self.id,
                generation,
                "ignoring change from inactive handle"
            );
        }
    }

    /// Unrecoverable failure reported by the handle of `generation`.
    pub fn handle_failure(&mut self, generation: u64, error: StoreError) {
        if self.is_cancelled() {
            self.enter_cancelled();
            return;
        }
        if self.is_current(generation) {
            self.complete(error);
        } else {
            tracing::trace!(
                subscription = %self.id,
                generation,
                error = %error,
                "ignoring failure from inactive handle"
            );
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        matches!(
            self.state,
            SubscriptionState::Observing { generation: current, .. } if current == generation
        )
    }

    fn start_observing(&mut self, demand: Demand) {
        self.generation += 1;
        let generation = self.generation;

        let handle = self.source.observe(&self.query);
        let forward = Arc::clone(&self.forward);
        handle.on_change(Box::new(move |notice: ChangeNotice| match notice {
            ChangeNotice::Changed => forward(Signal::Changed(generation)),
            ChangeNotice::Failed(error) => forward(Signal::Failed(generation, error)),
        }));
        tracing::debug!(
            subscription = %self.id,
            label = self.label(),
            generation,
            demand = %demand,
            "observation started"
        );

        let fetched = handle.perform_initial_fetch();
        self.state = SubscriptionState::Observing {
            handle,
            demand,
            generation,
        };
        match fetched {
            Ok(()) => self.deliver(),
            Err(error) => self.complete(error),
        }
    }

    /// Emit the current snapshot and settle the remaining demand.
    fn deliver(&mut self) {
        if self.is_cancelled() {
            self.enter_cancelled();
            return;
        }

        let (projected, demand) = match &self.state {
            SubscriptionState::Observing { handle, demand, .. } => {
                (P::project(handle, &self.mapper), *demand)
            }
            _ => return,
        };
        if demand.is_zero() {
            return;
        }

        let value = match projected {
            Some(value) => value,
            None => match self.config.missing_snapshot {
                MissingSnapshotPolicy::EmitEmpty => {
                    tracing::error!(
                        subscription = %self.id,
                        label = self.label(),
                        "handle exposed no snapshot after a successful fetch, emitting empty result"
                    );
                    P::empty()
                }
                MissingSnapshotPolicy::Fail => {
                    self.complete(StoreError::InvariantViolation(
                        "handle exposed no snapshot after a successful fetch".into(),
                    ));
                    return;
                }
            },
        };

        let additional = match self.subscriber.as_mut() {
            Some(subscriber) => subscriber.receive(value),
            None => return,
        };

        // Cancelled from inside receive
        if self.is_cancelled() {
            self.enter_cancelled();
            return;
        }

        let remaining = (demand + additional).consume_one();
        tracing::trace!(subscription = %self.id, demand = %remaining, "value delivered");
        if remaining.is_zero() {
            self.go_cold();
        } else if let SubscriptionState::Observing { demand, .. } = &mut self.state {
            *demand = remaining;
        }
    }

    fn go_cold(&mut self) {
        let previous = std::mem::replace(&mut self.state, SubscriptionState::WaitingForDemand);
        if let SubscriptionState::Observing {
            handle, generation, ..
        } = previous
        {
            handle.stop();
            tracing::debug!(subscription = %self.id, generation, "demand exhausted, observation stopped");
        }
    }

    fn complete(&mut self, error: StoreError) {
        let previous = std::mem::replace(&mut self.state, SubscriptionState::Completed);
        if let SubscriptionState::Observing { handle, .. } = previous {
            handle.stop();
        }
        tracing::debug!(subscription = %self.id, error = %error, "subscription failed");
        if let Some(mut subscriber) = self.subscriber.take() {
            subscriber.receive_error(error);
        }
    }

    fn enter_cancelled(&mut self) {
        if matches!(self.state, SubscriptionState::Cancelled) {
            return;
        }
        let previous = std::mem::replace(&mut self.state, SubscriptionState::Cancelled);
        if let SubscriptionState::Observing { handle, .. } = previous {
            handle.stop();
        }
        self.subscriber = None;
        tracing::debug!(subscription = %self.id, "subscription cancelled");
    }
}

impl<S, O, P> Drop for SubscriptionStateMachine<S, O, P>
where
    S: ObservationSource,
    P: ResultShape<S::Record, O>,
{
    fn drop(&mut self) {
        if let SubscriptionState::Observing { handle, .. } = &self.state {
            handle.stop();
        }
    }
}
