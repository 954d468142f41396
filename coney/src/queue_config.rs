//! Declaration options for queues.

use std::time::Duration;

use lapin::options::QueueDeclareOptions;
use lapin::types::{AMQPValue, FieldTable, ShortString};

/// Declaration options for a queue.
///
/// The defaults suit work queues: durable, non-exclusive and never
/// auto-deleted, so messages survive broker restarts and idle periods.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// The flags sent with `queue.declare`.
    pub(crate) options: QueueDeclareOptions,
    /// The x-arguments sent with `queue.declare`.
    pub(crate) arguments: FieldTable,
}

impl QueueConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Default::default()
    }

    /// Controls whether the queue survives a broker restart. On by default.
    pub fn with_durable(mut self, durable: bool) -> Self {
        self.options.durable = durable;
        self
    }

    /// Restricts the queue to the declaring connection and deletes it when
    /// that connection closes. Off by default.
    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.options.exclusive = exclusive;
        self
    }

    /// Deletes the queue once its last consumer unsubscribes. Off by default;
    /// a work queue usually has to outlive its consumers.
    pub fn with_auto_delete(mut self, auto_delete: bool) -> Self {
        self.options.auto_delete = auto_delete;
        self
    }

    /// Expires the whole queue after it has gone `ttl` without being used
    /// (the broker's `x-expires` argument).
    ///
    /// # Panics
    /// Panics if `ttl` is 2^32 milliseconds or longer, which the broker
    /// cannot represent.
    pub fn with_expires(mut self, ttl: Duration) -> Self {
        self.arguments
            .insert("x-expires".into(), Self::broker_millis(ttl).into());
        self
    }

    /// Drops messages that sit unconsumed for longer than `ttl` (the broker's
    /// `x-message-ttl` argument).
    ///
    /// # Panics
    /// Panics if `ttl` is 2^32 milliseconds or longer, which the broker
    /// cannot represent.
    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.arguments
            .insert("x-message-ttl".into(), Self::broker_millis(ttl).into());
        self
    }

    /// Routes dead-lettered messages (rejected without requeue, or expired)
    /// to the given exchange.
    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.into().into()),
        );
        self
    }

    /// Overrides the routing key dead-lettered messages are republished with.
    /// Without it the broker keeps each message's original routing key.
    pub fn with_dead_letter_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.arguments.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(routing_key.into().into()),
        );
        self
    }

    /// Sets a raw x-argument. The typed setters above cover the common ones;
    /// this is the escape hatch for everything else.
    pub fn with_arg(mut self, arg: impl Into<ShortString>, value: impl Into<AMQPValue>) -> Self {
        self.arguments.insert(arg.into(), value.into());
        self
    }

    /// Converts a TTL into the 32-bit millisecond count the x-arguments carry.
    fn broker_millis(ttl: Duration) -> u32 {
        ttl.as_millis()
            .try_into()
            .expect("TTL does not fit in 32 bits of milliseconds")
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            options: QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            arguments: Default::default(),
        }
    }
}
