//! Coney-specific error types.

use thiserror::Error as ThisError;

/// Errors that may be returned by `coney` when setting up or running consumers.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The broker could not be reached within the pool's connect retry budget.
    #[error("failed to reach the AMQP broker within the retry budget: {0}")]
    BrokerUnreachable(#[source] lapin::Error),

    /// The connection pool was disposed. This is terminal; create a new pool instead.
    #[error("the connection pool has been disposed")]
    PoolDisposed,

    /// A message payload could not be encoded for publishing.
    #[error(transparent)]
    Serializer(#[from] SerializerError),

    /// An error from an underlying lapin call.
    #[error("An underlying `lapin` call failed: {0}")]
    Lapin(#[from] lapin::Error),
}

/// Errors produced by [`Serializer`](crate::Serializer) implementations.
#[derive(Debug, ThisError)]
pub enum SerializerError {
    /// A value could not be encoded into a byte payload.
    #[error("failed to encode message: {0}")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A byte payload could not be decoded into the required type.
    #[error("failed to decode message: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Errors produced by [`FeedbackSender`](crate::FeedbackSender).
#[derive(Debug, ThisError)]
pub enum FeedbackError {
    /// The delivery was already acked or nacked. Resolving feedback twice is a
    /// programming error; the second resolution never reaches the broker.
    #[error("feedback for delivery {delivery_tag} was already sent")]
    AlreadySent {
        /// The channel-local tag of the delivery that was resolved twice.
        delivery_tag: u64,
    },

    /// An error from the underlying lapin ack/nack call.
    #[error("An underlying `lapin` call failed: {0}")]
    Lapin(#[from] lapin::Error),
}

/// Structured signals that a [`Worker`](crate::Worker) may return, or wrap as the
/// direct source of its own error type, to direct how its message is resolved.
///
/// Signals override the worker's default [`FailureStrategy`](crate::FailureStrategy):
/// [`Retry`](Signal::Retry) forces another attempt (while attempts remain),
/// [`Requeue`](Signal::Requeue) sends the message straight back to its queue, and
/// [`Discard`](Signal::Discard) drops it to the rejection handler immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum Signal {
    /// The handler wants the message to be attempted again.
    #[error("the handler requested another delivery attempt")]
    Retry,

    /// The handler wants the message returned to its queue for later redelivery.
    #[error("the handler requested the message be returned to its queue")]
    Requeue,

    /// The handler wants the message dropped without redelivery.
    #[error("the handler requested the message be dropped")]
    Discard,
}

/// Finds the [`Signal`] carried by a handler error, if any.
///
/// Inspects the error itself and its immediate cause, and nothing deeper.
/// Signals buried further down a cause chain are deliberately ignored;
/// a handler that wants to direct resolution must keep the signal on top.
pub(crate) fn classify(error: &anyhow::Error) -> Option<Signal> {
    error
        .chain()
        .take(2)
        .find_map(|cause| cause.downcast_ref::<Signal>())
        .copied()
}
