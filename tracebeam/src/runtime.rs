//! Abstraction over the async runtime driving background work.
//!
//! The batch worker and the probability negotiation need three things from a
//! runtime: spawning a detached task, sleeping, and a periodic tick. Keeping
//! those behind a trait lets the crate run on any current or future runtime;
//! a [Tokio] implementation ships behind the `rt-tokio` feature.
//!
//! [Tokio]: https://crates.io/crates/tokio

use futures_util::{future::BoxFuture, stream::Stream};
use std::{fmt::Debug, future::Future, time::Duration};
use thiserror::Error;

/// An abstraction of an async runtime.
pub trait Runtime: Clone + Send + Sync + 'static {
    /// A stream yielding an item per elapsed interval. The item type is not
    /// important.
    type Interval: Stream + Send;

    /// A future resolving after a requested amount of time. The output type
    /// is not important.
    type Delay: Future + Send + Unpin;

    /// Create a stream that yields a new item every `duration`.
    fn interval(&self, duration: Duration) -> Self::Interval;

    /// Spawn a detached task executing the given future.
    ///
    /// No handle is returned; completion is observed through channels owned
    /// by the spawned work itself.
    fn spawn(&self, future: BoxFuture<'static, ()>);

    /// Return a future resolving after `duration`.
    fn delay(&self, duration: Duration) -> Self::Delay;
}

/// Error returned by a [`TrySend`] implementation.
#[derive(Debug, Error)]
pub enum TrySendError {
    /// Send failed because the channel is at capacity.
    #[error("cannot send message to the worker as the channel is full")]
    ChannelFull,
    /// Send failed because the receiving worker is gone.
    #[error("cannot send message to the worker as the channel is closed")]
    ChannelClosed,
    /// Any other send failure.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// An abstraction of a `Sender` capable of sending messages through a shared
/// reference.
pub trait TrySend: Sync + Send {
    /// The message type carried by the channel.
    type Message;

    /// Try to send a message to the worker.
    ///
    /// Fails when the channel is full (the worker is behind) or closed (the
    /// worker has shut down).
    fn try_send(&self, item: Self::Message) -> Result<(), TrySendError>;
}

/// Extension of [`Runtime`] providing the bounded message channel used by the
/// batch worker.
///
/// Senders must be cloneable: the worker holds one to post its own
/// timer-expiry messages back into the stream it is draining.
pub trait RuntimeChannel: Runtime {
    /// The stream side handed to the worker.
    type Receiver<T: Debug + Send + 'static>: Stream<Item = T> + Send;
    /// The sender side held by handles and by the worker itself.
    type Sender<T: Debug + Send + 'static>: TrySend<Message = T> + Debug + Clone;

    /// Create the sender and receiver for a bounded message channel.
    fn batch_message_channel<T: Debug + Send + 'static>(
        &self,
        capacity: usize,
    ) -> (Self::Sender<T>, Self::Receiver<T>);
}

/// Runtime implementation backed by Tokio's multi-thread runtime.
#[cfg(feature = "rt-tokio")]
#[cfg_attr(docsrs, doc(cfg(feature = "rt-tokio")))]
#[derive(Debug, Clone)]
pub struct Tokio;

#[cfg(feature = "rt-tokio")]
#[cfg_attr(docsrs, doc(cfg(feature = "rt-tokio")))]
impl Runtime for Tokio {
    type Interval = tokio_stream::wrappers::IntervalStream;
    type Delay = std::pin::Pin<Box<tokio::time::Sleep>>;

    fn interval(&self, duration: Duration) -> Self::Interval {
        tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(duration))
    }

    fn spawn(&self, future: BoxFuture<'static, ()>) {
        #[allow(clippy::let_underscore_future)]
        // the task is detached; completion is observed via channels
        let _ = tokio::spawn(future);
    }

    fn delay(&self, duration: Duration) -> Self::Delay {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[cfg(feature = "rt-tokio")]
impl<T: Send> TrySend for tokio::sync::mpsc::Sender<T> {
    type Message = T;

    fn try_send(&self, item: Self::Message) -> Result<(), TrySendError> {
        self.try_send(item).map_err(|err| match err {
            tokio::sync::mpsc::error::TrySendError::Full(_) => TrySendError::ChannelFull,
            tokio::sync::mpsc::error::TrySendError::Closed(_) => TrySendError::ChannelClosed,
        })
    }
}

#[cfg(feature = "rt-tokio")]
#[cfg_attr(docsrs, doc(cfg(feature = "rt-tokio")))]
impl RuntimeChannel for Tokio {
    type Receiver<T: Debug + Send + 'static> = tokio_stream::wrappers::ReceiverStream<T>;
    type Sender<T: Debug + Send + 'static> = tokio::sync::mpsc::Sender<T>;

    fn batch_message_channel<T: Debug + Send + 'static>(
        &self,
        capacity: usize,
    ) -> (Self::Sender<T>, Self::Receiver<T>) {
        let (sender, receiver) = tokio::sync::mpsc::channel(capacity);
        (
            sender,
            tokio_stream::wrappers::ReceiverStream::new(receiver),
        )
    }
}

#[cfg(all(test, feature = "rt-tokio"))]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn delay_resolves() {
        Tokio.delay(Duration::from_millis(1)).await;
    }

    #[tokio::test]
    async fn channel_round_trip() {
        let (sender, mut receiver) = Tokio.batch_message_channel::<u32>(4);
        sender.try_send(7).unwrap();
        assert_eq!(receiver.next().await, Some(7));
    }

    #[tokio::test]
    async fn full_channel_reports_channel_full() {
        let (sender, _receiver) = Tokio.batch_message_channel::<u32>(1);
        sender.try_send(1).unwrap();
        assert!(matches!(
            TrySend::try_send(&sender, 2),
            Err(TrySendError::ChannelFull)
        ));
    }

    #[tokio::test]
    async fn closed_channel_reports_channel_closed() {
        let (sender, receiver) = Tokio.batch_message_channel::<u32>(1);
        drop(receiver);
        assert!(matches!(
            TrySend::try_send(&sender, 1),
            Err(TrySendError::ChannelClosed)
        ));
    }
}
