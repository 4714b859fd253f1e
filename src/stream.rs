//! Subscribable result streams.
//!
//! A [`ResultStream`] pairs a query with a [`ValueMapper`] and an observation
//! source. Every [`subscribe`](ResultStream::subscribe) call creates an
//! independent [`SubscriptionStateMachine`] behind a mailbox:
//!
//! - `request`, `cancel` and handle callbacks all enqueue a [`Signal`]
//! - whichever thread finds the mailbox idle drains it, one signal at a time
//! - calls made while another thread drains (or from inside the subscriber's
//!   `receive`) enqueue and return immediately
//!
//! Cancellation also flips a shared flag before enqueueing, so a drain in
//! progress stops delivering right away.

use crate::demand::Demand;
use crate::machine::{
    Flat, ResultShape, Sectioned, Signal, SignalForwarder, SubscriptionConfig, SubscriptionId,
    SubscriptionStateMachine, SubscriptionStatus,
};
use crate::mapper::ValueMapper;
use crate::observation::ObservationSource;
use crate::query::Query;
use crate::subscriber::{ChannelSubscriber, StreamEvent, Subscriber};
use crossbeam_channel::{unbounded, Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Live, demand-driven stream over the result set of one query.
pub struct ResultStream<S, O, P>
where
    S: ObservationSource,
    P: ResultShape<S::Record, O>,
{
    source: S,
    query: Arc<Query>,
    mapper: ValueMapper<S::Record, O>,
    config: SubscriptionConfig,
    _shape: PhantomData<fn() -> P>,
}

impl<S, O> ResultStream<S, O, Flat>
where
    S: ObservationSource + Clone,
    O: Send + 'static,
{
    /// Stream emitting the mapped result as one ordered list.
    pub fn flat(
        source: S,
        query: impl Into<Arc<Query>>,
        mapper: ValueMapper<S::Record, O>,
    ) -> Self {
        Self::build(source, query.into(), mapper)
    }
}

impl<S, O> ResultStream<S, O, Sectioned>
where
    S: ObservationSource + Clone,
    O: Send + 'static,
{
    /// Stream emitting the mapped result grouped into sections.
    pub fn sectioned(
        source: S,
        query: impl Into<Arc<Query>>,
        mapper: ValueMapper<S::Record, O>,
    ) -> Self {
        Self::build(source, query.into(), mapper)
    }
}

impl<S, O, P> ResultStream<S, O, P>
where
    S: ObservationSource + Clone,
    O: Send + 'static,
    P: ResultShape<S::Record, O>,
{
    fn build(source: S, query: Arc<Query>, mapper: ValueMapper<S::Record, O>) -> Self {
        Self {
            source,
            query,
            mapper,
            config: SubscriptionConfig::default(),
            _shape: PhantomData,
        }
    }

    /// Settings applied to every later subscription.
    pub fn with_config(mut self, config: SubscriptionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Attach a subscriber. Nothing is fetched until demand is requested.
    pub fn subscribe<C>(&self, subscriber: C) -> Subscription
    where
        C: Subscriber<P::Output>,
    {
        let machine = SubscriptionStateMachine::<S, O, P>::new(
            self.source.clone(),
            Arc::clone(&self.query),
            self.mapper.clone(),
            Box::new(subscriber),
            self.config.clone(),
        );
        let mailbox: Arc<dyn Control> = Mailbox::spawn(machine);
        Subscription {
            registration: Arc::new(Registration(mailbox)),
        }
    }

    /// Subscribe through a channel, for consumers on another thread.
    pub fn subscribe_channel(&self) -> ChannelSubscription<P::Output> {
        let (sender, receiver) = unbounded();
        let subscription = self.subscribe(ChannelSubscriber::new(sender));
        ChannelSubscription {
            subscription,
            receiver,
        }
    }
}

/// Type-erased mailbox operations.
trait Control: Send + Sync {
    fn id(&self) -> SubscriptionId;
    fn label(&self) -> Option<&str>;
    fn signal(&self, signal: Signal);
    fn cancel(&self);
    fn status(&self) -> SubscriptionStatus;
    fn handles_created(&self) -> u64;
}

struct Mailbox<S, O, P>
where
    S: ObservationSource,
    P: ResultShape<S::Record, O>,
{
    id: SubscriptionId,
    label: Option<String>,
    machine: Mutex<SubscriptionStateMachine<S, O, P>>,
    sender: Sender<Signal>,
    receiver: Receiver<Signal>,
    /// Signals enqueued but not yet accounted for by the drainer.
    wip: AtomicUsize,
    cancelled: Arc<AtomicBool>,
    /// Mirrors of machine state, readable while a drain holds the machine.
    status: Mutex<SubscriptionStatus>,
    handles_created: AtomicU64,
}

impl<S, O, P> Mailbox<S, O, P>
where
    S: ObservationSource,
    O: Send + 'static,
    P: ResultShape<S::Record, O>,
{
    fn spawn(machine: SubscriptionStateMachine<S, O, P>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let forward: SignalForwarder = Arc::new(move |signal: Signal| {
                if let Some(mailbox) = weak.upgrade() {
                    mailbox.signal(signal);
                }
            });
            let machine = machine.with_forwarder(forward);
            let (sender, receiver) = unbounded();
            Self {
                id: machine.id(),
                label: machine.config().label.clone(),
                cancelled: machine.cancel_flag(),
                status: Mutex::new(machine.status()),
                handles_created: AtomicU64::new(0),
                machine: Mutex::new(machine),
                sender,
                receiver,
                wip: AtomicUsize::new(0),
            }
        })
    }

    fn drain(&self) {
        let mut machine = self.machine.lock();
        while let Ok(signal) = self.receiver.try_recv() {
            machine.process(signal);
            // Readers see the state after each signal
            *self.status.lock() = machine.status();
            self.handles_created
                .store(machine.handles_created(), Ordering::Release);
        }
    }
}

impl<S, O, P> Control for Mailbox<S, O, P>
where
    S: ObservationSource,
    O: Send + 'static,
    P: ResultShape<S::Record, O>,
{
    fn id(&self) -> SubscriptionId {
        self.id
    }

    fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    fn signal(&self, signal: Signal) {
        if self.cancelled.load(Ordering::Acquire) && !matches!(signal, Signal::Cancel) {
            return;
        }
        // The mailbox owns the receiver, so sending cannot fail
        if self.sender.send(signal).is_err() {
            return;
        }
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }

        let mut missed = 1;
        loop {
            self.drain();
            let previous = self.wip.fetch_sub(missed, Ordering::AcqRel);
            missed = previous - missed;
            if missed == 0 {
                break;
            }
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.signal(Signal::Cancel);
    }

    fn status(&self) -> SubscriptionStatus {
        if self.cancelled.load(Ordering::Acquire) {
            return SubscriptionStatus::Cancelled;
        }
        *self.status.lock()
    }

    fn handles_created(&self) -> u64 {
        self.handles_created.load(Ordering::Acquire)
    }
}

/// Cancels the subscription when the last [`Subscription`] clone drops.
struct Registration(Arc<dyn Control>);

impl Drop for Registration {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Consumer-side control of one subscription.
///
/// Cheap to clone; all clones control the same subscription, and dropping
/// the last one cancels it. A subscriber that keeps a clone of its own
/// subscription keeps it alive until it is cancelled or completes.
#[derive(Clone)]
pub struct Subscription {
    registration: Arc<Registration>,
}

impl Subscription {
    fn control(&self) -> &dyn Control {
        self.registration.0.as_ref()
    }

    pub fn id(&self) -> SubscriptionId {
        self.control().id()
    }

    /// Grant more demand. Safe to call from inside the subscriber.
    pub fn request(&self, demand: Demand) {
        self.control().signal(Signal::Request(demand));
    }

    /// Stop the subscription. No value is delivered after this returns.
    pub fn cancel(&self) {
        self.control().cancel();
    }

    /// Status as of the last fully processed signal.
    ///
    /// While a value is being delivered this still reports the state before
    /// that delivery. A cancellation is visible as soon as it is requested.
    pub fn status(&self) -> SubscriptionStatus {
        self.control().status()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Number of observation handles created so far; one per demand window.
    pub fn handles_created(&self) -> u64 {
        self.control().handles_created()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id())
            .field("label", &self.control().label())
            .field("status", &self.status())
            .finish()
    }
}

/// Subscription whose values arrive on a channel.
///
/// The channel subscriber grants no demand of its own: call
/// [`request`](ChannelSubscription::request) for every value wanted, or
/// request [`Demand::unlimited`] once. After cancellation or failure the
/// channel disconnects once drained.
pub struct ChannelSubscription<T> {
    subscription: Subscription,
    receiver: Receiver<StreamEvent<T>>,
}

impl<T> ChannelSubscription<T> {
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn request(&self, demand: Demand) {
        self.subscription.request(demand);
    }

    pub fn cancel(&self) {
        self.subscription.cancel();
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.subscription.status()
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<StreamEvent<T>, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<StreamEvent<T>, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<StreamEvent<T>, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Request one value and wait up to `timeout` for it.
    pub fn next_timeout(&self, timeout: Duration) -> Result<StreamEvent<T>, RecvTimeoutError> {
        self.request(Demand::max(1));
        self.recv_timeout(timeout)
    }
}
