//! Per-delivery acknowledgement.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};

use lapin::acker::Acker;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use tracing::{debug, error, warn};

use crate::error::FeedbackError;

/// The single-shot acknowledgement gate for one delivery.
///
/// Exactly one of [`ack`](FeedbackSender::ack), [`nack(true)`](FeedbackSender::nack)
/// or [`nack(false)`](FeedbackSender::nack) must be called during the sender's
/// lifetime. A second resolution fails with [`FeedbackError::AlreadySent`] and
/// never reaches the broker.
///
/// If the sender is dropped unresolved, it nacks with `requeue = true` so the
/// broker redelivers the message. This almost certainly indicates a panic or an
/// abort during processing.
#[derive(Debug)]
pub struct FeedbackSender {
    /// The acker of the delivery, carrying its originating channel.
    acker: Acker,
    /// The channel-local tag of the delivery.
    delivery_tag: u64,
    /// The queue the delivery came from. Only used for logging.
    queue: String,
    /// Set on the first resolution; later resolutions fail loudly.
    resolved: AtomicBool,
}

impl FeedbackSender {
    /// Builds a sender from the parts of a delivery.
    pub(crate) fn from_parts(acker: Acker, delivery_tag: u64, queue: String) -> Self {
        Self {
            acker,
            delivery_tag,
            queue,
            resolved: AtomicBool::new(false),
        }
    }

    /// The channel-local tag of the delivery this sender resolves.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether this sender has already been resolved.
    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::SeqCst)
    }

    /// Acknowledges the delivery, letting the broker know it was processed successfully.
    ///
    /// # Errors
    /// [`FeedbackError::AlreadySent`] if the delivery was already resolved;
    /// otherwise errors from the underlying ack on network failures.
    pub async fn ack(&self) -> Result<(), FeedbackError> {
        self.mark_resolved()?;
        self.acker.ack(BasicAckOptions { multiple: false }).await?;
        Ok(())
    }

    /// Negatively acknowledges the delivery. With `requeue`, the broker returns
    /// the message to its queue for redelivery; without, the message is dropped
    /// (or dead-lettered, if the queue is configured for it).
    ///
    /// # Errors
    /// [`FeedbackError::AlreadySent`] if the delivery was already resolved;
    /// otherwise errors from the underlying nack on network failures.
    pub async fn nack(&self, requeue: bool) -> Result<(), FeedbackError> {
        self.mark_resolved()?;
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?;
        Ok(())
    }

    /// Flips the one-shot flag, failing if it was already set.
    fn mark_resolved(&self) -> Result<(), FeedbackError> {
        if self
            .resolved
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(FeedbackError::AlreadySent {
                delivery_tag: self.delivery_tag,
            });
        }
        Ok(())
    }
}

/// Unresolved senders nack with requeue on drop, so the broker redelivers the
/// message instead of holding it unacked until the channel dies.
impl Drop for FeedbackSender {
    fn drop(&mut self) {
        if self.is_resolved() {
            return;
        }

        warn!(
            queue = %self.queue,
            delivery_tag = self.delivery_tag,
            "nacking unresolved delivery due to drop"
        );

        let delivery_tag = self.delivery_tag;
        // Yoink the acker so we can give it to a future to nack the message.
        let acker = mem::take(&mut self.acker);

        // Nacking is async so we have to spawn a task to do it.
        // Unfortunately we can't really be sure that this ever completes.
        tokio::spawn(async move {
            match acker
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: true,
                })
                .await
            {
                Ok(()) => debug!(delivery_tag, "nacked delivery during drop"),
                Err(e) => error!(delivery_tag, "failed to nack delivery during drop: {e}"),
            }
        });

        self.resolved.store(true, Ordering::SeqCst);
    }
}
