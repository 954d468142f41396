//! Terminal sinks for messages the consumer gives up on.

use std::fmt;

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, ExchangeKind};
use tracing::{debug, warn};

use crate::error::SerializerError;
use crate::pool::ConnectionPool;

/// Why a message ended up at the rejection handler.
#[derive(Debug)]
pub enum RejectReason {
    /// The payload could not be decoded into the worker's message type.
    Undecodable(SerializerError),
    /// Processing concluded the message must be permanently dropped, either by
    /// a discard signal or by exhausting its attempts without a requeue.
    Discarded {
        /// How many times the worker was invoked before giving up.
        attempts: u32,
    },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undecodable(e) => write!(f, "undecodable payload: {e}"),
            Self::Discarded { attempts } => {
                write!(f, "discarded after {attempts} attempt(s)")
            }
        }
    }
}

/// A sink for deliveries that are nacked without requeue.
///
/// Handlers run after the broker-side nack has been issued (or concurrently
/// with it); they exist for durable audit, not for flow control. They must not
/// fail: anything that goes wrong inside a handler stays inside it.
#[async_trait]
pub trait RejectionHandler: Send + Sync + 'static {
    /// Called with the raw payload of a rejected delivery.
    async fn on_rejection(&self, payload: &[u8], reason: &RejectReason, queue: &str, vhost: &str);
}

/// The default rejection handler: republishes the raw payload to a per-queue
/// rejection exchange so the message survives for inspection.
///
/// The exchange is a durable topic exchange named `<queue>.rejected`, declared
/// idempotently on every rejection, and the payload is published persistently
/// with the queue name as the routing key. If the publish fails it is logged
/// and swallowed; the nack has already been issued either way.
pub struct PublishingRejectionHandler {
    /// The pool used to obtain a short-lived channel per rejection.
    pool: ConnectionPool,
}

impl PublishingRejectionHandler {
    /// Creates a handler publishing through the given pool.
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// The name of the rejection exchange for a queue.
    pub fn exchange_for(queue: &str) -> String {
        format!("{queue}.rejected")
    }

    /// Declares the rejection exchange and publishes the payload to it.
    async fn publish(&self, payload: &[u8], queue: &str) -> Result<(), crate::Error> {
        let channel = self.pool.create_channel().await?;
        let exchange = Self::exchange_for(queue);

        channel
            .exchange_declare(
                &exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        channel
            .basic_publish(
                &exchange,
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_content_type(ShortString::from("application/octet-stream"))
                    // Persistent, so rejected payloads survive a broker restart.
                    .with_delivery_mode(2),
            )
            .await?
            .await?;

        let _ = channel.close(200, "rejection published").await;
        Ok(())
    }
}

#[async_trait]
impl RejectionHandler for PublishingRejectionHandler {
    async fn on_rejection(&self, payload: &[u8], reason: &RejectReason, queue: &str, vhost: &str) {
        debug!(
            queue,
            vhost,
            %reason,
            bytes = payload.len(),
            "publishing rejected payload"
        );

        if let Err(e) = self.publish(payload, queue).await {
            // The message is already nacked; losing the audit copy is not fatal.
            warn!(queue, vhost, "failed to publish rejected payload: {e:#}");
        }
    }
}

/// A rejection handler that only logs. For users who have dead-lettering
/// configured broker-side, or who genuinely do not care.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardingRejectionHandler;

#[async_trait]
impl RejectionHandler for DiscardingRejectionHandler {
    async fn on_rejection(&self, payload: &[u8], reason: &RejectReason, queue: &str, vhost: &str) {
        warn!(
            queue,
            vhost,
            %reason,
            bytes = payload.len(),
            "dropping rejected payload"
        );
    }
}
