//! Consumers of result streams.

use crate::demand::Demand;
use crate::error::StoreError;
use crossbeam_channel::Sender;

/// Receiving end of a result stream.
///
/// `receive` returns the additional demand the consumer grants while
/// handling the value. It is applied in the same delivery step, so returning
/// `Demand::max(1)` from every call keeps the stream flowing one value at a
/// time. After `receive_error` no further calls are made.
pub trait Subscriber<T>: Send + 'static {
    fn receive(&mut self, value: T) -> Demand;

    fn receive_error(&mut self, error: StoreError);
}

/// Closure-backed subscriber.
pub struct Sink<V, E> {
    on_value: V,
    on_error: E,
}

impl<V> Sink<V, fn(StoreError)> {
    /// Subscriber from a value closure. Failures are logged.
    pub fn new(on_value: V) -> Self {
        Sink {
            on_value,
            on_error: log_error,
        }
    }
}

impl<V, E> Sink<V, E> {
    /// Replace the failure handler.
    pub fn on_error<E2>(self, on_error: E2) -> Sink<V, E2> {
        Sink {
            on_value: self.on_value,
            on_error,
        }
    }
}

fn log_error(error: StoreError) {
    tracing::error!(error = %error, "result stream failed");
}

impl<T, V, E> Subscriber<T> for Sink<V, E>
where
    V: FnMut(T) -> Demand + Send + 'static,
    E: FnMut(StoreError) + Send + 'static,
{
    fn receive(&mut self, value: T) -> Demand {
        (self.on_value)(value)
    }

    fn receive_error(&mut self, error: StoreError) {
        (self.on_error)(error)
    }
}

/// Event forwarded by a [`ChannelSubscriber`].
#[derive(Debug)]
pub enum StreamEvent<T> {
    Value(T),
    Failed(StoreError),
}

impl<T> StreamEvent<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            StreamEvent::Value(value) => Some(value),
            StreamEvent::Failed(_) => None,
        }
    }
}

/// Forwards everything into a channel and grants no extra demand; the
/// receiving side requests more explicitly.
pub struct ChannelSubscriber<T> {
    sender: Sender<StreamEvent<T>>,
}

impl<T> ChannelSubscriber<T> {
    pub fn new(sender: Sender<StreamEvent<T>>) -> Self {
        Self { sender }
    }
}

impl<T: Send + 'static> Subscriber<T> for ChannelSubscriber<T> {
    fn receive(&mut self, value: T) -> Demand {
        // A dropped receiver means nobody is listening; the value is discarded
        let _ = self.sender.send(StreamEvent::Value(value));
        Demand::none()
    }

    fn receive_error(&mut self, error: StoreError) {
        let _ = self.sender.send(StreamEvent::Failed(error));
    }
}
