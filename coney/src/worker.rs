//! The per-message processing state machine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{classify, Signal};
use crate::feedback::FeedbackSender;
use crate::rejection::{RejectReason, RejectionHandler};
use crate::serializer::Serializer;

/// A user-supplied processing function for messages of one type.
///
/// The worker is invoked once per delivery attempt; the message is passed by
/// reference because a failed attempt may be retried with the same message.
/// The token is cancelled when the consumer shuts down, so long-running
/// handlers can wind down early; honoring it is optional.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// The decoded message type this worker processes.
    type Message: Send + Sync;

    /// Processes one message.
    ///
    /// Returning `Ok` acknowledges the delivery. Returning an error hands the
    /// decision to the retry policy: the error (or its direct source) may carry
    /// a [`Signal`] to force a retry, a requeue or a discard; otherwise the
    /// worker's default [`FailureStrategy`] applies.
    async fn handle(
        &self,
        message: &Self::Message,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}

/// What to do with a message whose handler failed without signalling.
///
/// The strategy covers errors that carry no [`Signal`]; signalled errors
/// always take precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureStrategy {
    /// Invoke the handler again while attempts remain; once the budget is
    /// spent, drop the message to the rejection handler.
    Retry,
    /// Invoke the handler again while attempts remain; once the budget is
    /// spent, return the message to its queue for redelivery.
    #[default]
    Requeue,
    /// Drop the message to the rejection handler on the first failure.
    Discard,
    /// No default handling; failures are terminal and the message is dropped,
    /// as with [`Discard`](FailureStrategy::Discard).
    None,
}

/// Configuration of the processing worker's retry behavior.
///
/// The default is the single-invocation variant: one attempt, after which the
/// strategy (and any signal on the error) decides between requeue and discard.
/// Raising [`max_attempts`](WorkerOptions::with_max_attempts) turns on the
/// retrying variant; both share the same processing contract.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// The policy for failures that carry no signal.
    pub(crate) strategy: FailureStrategy,
    /// The attempt budget per delivery, including the first invocation.
    pub(crate) max_attempts: u32,
    /// How long to wait between attempts.
    pub(crate) retry_delay: Duration,
}

impl WorkerOptions {
    /// Creates the default options.
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the policy for failures that carry no signal. Defaults to
    /// [`FailureStrategy::Requeue`].
    pub fn with_strategy(mut self, strategy: FailureStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the attempt budget per delivery. Defaults to 1 (no retries).
    ///
    /// # Panics
    /// Panics if `max_attempts` is zero; every delivery is attempted at least once.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the wait between attempts. Defaults to zero.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            strategy: FailureStrategy::default(),
            max_attempts: 1,
            retry_delay: Duration::ZERO,
        }
    }
}

/// How the attempt loop concluded for one message.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// An attempt succeeded; the delivery is acked.
    Completed {
        /// How many attempts were made, including the successful one.
        attempts: u32,
    },
    /// All attempts failed and the message goes back to its queue.
    Requeue {
        /// How many attempts were made.
        attempts: u32,
    },
    /// All attempts failed and the message is dropped to the rejection handler.
    Discard {
        /// How many attempts were made.
        attempts: u32,
    },
    /// Cancellation interrupted the loop; the message goes back to its queue.
    Cancelled,
}

/// Invokes the worker until it succeeds, the retry policy gives up, or the
/// token is cancelled.
pub(crate) async fn run_attempts<W: Worker>(
    worker: &W,
    message: &W::Message,
    options: &WorkerOptions,
    cancel: &CancellationToken,
) -> Outcome {
    let mut attempts: u32 = 0;
    let mut errors: Vec<anyhow::Error> = Vec::new();

    loop {
        if attempts > 0 && !options.retry_delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Outcome::Cancelled,
                _ = tokio::time::sleep(options.retry_delay) => {}
            }
        }

        attempts += 1;
        match worker.handle(message, cancel).await {
            Ok(()) => return Outcome::Completed { attempts },
            Err(error) => {
                debug!(attempt = attempts, "handler attempt failed: {error:#}");
                errors.push(error);
            }
        }

        if !should_retry(attempts, &errors, options) {
            break;
        }
    }

    if should_requeue(&errors, options.strategy) {
        Outcome::Requeue { attempts }
    } else {
        Outcome::Discard { attempts }
    }
}

/// Whether another attempt should be made after a failure.
fn should_retry(attempts: u32, errors: &[anyhow::Error], options: &WorkerOptions) -> bool {
    if attempts >= options.max_attempts {
        return false;
    }

    match errors.last().and_then(classify) {
        Some(Signal::Retry) => true,
        Some(Signal::Requeue) | Some(Signal::Discard) => false,
        None => matches!(
            options.strategy,
            FailureStrategy::Retry | FailureStrategy::Requeue
        ),
    }
}

/// Whether a message whose attempts are spent goes back to its queue.
fn should_requeue(errors: &[anyhow::Error], strategy: FailureStrategy) -> bool {
    match errors.last().and_then(classify) {
        Some(Signal::Requeue) => true,
        Some(Signal::Discard) => false,
        Some(Signal::Retry) | None => strategy == FailureStrategy::Requeue,
    }
}

/// The type-erased face of a processing worker, as seen by a queue consumer.
///
/// Implemented by [`MessageProcessor`]; custom implementations get raw payloads
/// and full control over feedback resolution.
#[async_trait]
pub trait DeliveryProcessor: Send + Sync + 'static {
    /// Processes one raw delivery and resolves its feedback.
    ///
    /// Implementations must resolve `feedback` exactly once on every path that
    /// is not interrupted by cancellation.
    async fn process(&self, body: Vec<u8>, feedback: FeedbackSender, cancel: CancellationToken);
}

/// The standard processing worker: decodes the payload, runs the attempt loop
/// and translates the outcome into broker feedback.
pub struct MessageProcessor<W, S> {
    /// The user's processing function.
    worker: W,
    /// The codec for this queue's payloads.
    serializer: S,
    /// Where permanently rejected payloads go.
    rejection: Arc<dyn RejectionHandler>,
    /// Retry policy and defaults.
    options: WorkerOptions,
    /// The queue this processor serves. Used for rejections and logging.
    queue: String,
    /// The virtual host the queue lives in. Passed through to rejections.
    vhost: String,
}

impl<W, S> MessageProcessor<W, S> {
    /// Creates a processor for one queue.
    pub fn new(
        worker: W,
        serializer: S,
        rejection: Arc<dyn RejectionHandler>,
        options: WorkerOptions,
        queue: impl Into<String>,
        vhost: impl Into<String>,
    ) -> Self {
        Self {
            worker,
            serializer,
            rejection,
            options,
            queue: queue.into(),
            vhost: vhost.into(),
        }
    }
}

#[async_trait]
impl<W, S> DeliveryProcessor for MessageProcessor<W, S>
where
    W: Worker,
    S: Serializer<W::Message>,
{
    async fn process(&self, body: Vec<u8>, feedback: FeedbackSender, cancel: CancellationToken) {
        let message = match self.serializer.deserialize(&body) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    queue = %self.queue,
                    delivery_tag = feedback.delivery_tag(),
                    "failed to decode delivery, rejecting it: {e}"
                );
                if let Err(e) = feedback.nack(false).await {
                    error!(queue = %self.queue, "failed to nack undecodable delivery: {e}");
                }
                self.rejection
                    .on_rejection(&body, &RejectReason::Undecodable(e), &self.queue, &self.vhost)
                    .await;
                return;
            }
        };

        let started = Instant::now();
        match run_attempts(&self.worker, &message, &self.options, &cancel).await {
            Outcome::Completed { attempts } => {
                debug!(
                    queue = %self.queue,
                    attempts,
                    elapsed = ?started.elapsed(),
                    "delivery processed"
                );
                if let Err(e) = feedback.ack().await {
                    error!(queue = %self.queue, "failed to ack delivery: {e}");
                }
            }
            Outcome::Requeue { attempts } => {
                warn!(
                    queue = %self.queue,
                    attempts,
                    "handler failed, returning the delivery to its queue"
                );
                if let Err(e) = feedback.nack(true).await {
                    error!(queue = %self.queue, "failed to nack delivery for requeue: {e}");
                }
            }
            Outcome::Discard { attempts } => {
                warn!(
                    queue = %self.queue,
                    attempts,
                    "handler failed terminally, rejecting the delivery"
                );
                if let Err(e) = feedback.nack(false).await {
                    error!(queue = %self.queue, "failed to nack discarded delivery: {e}");
                }
                self.rejection
                    .on_rejection(
                        &body,
                        &RejectReason::Discarded { attempts },
                        &self.queue,
                        &self.vhost,
                    )
                    .await;
            }
            Outcome::Cancelled => {
                debug!(
                    queue = %self.queue,
                    "processing interrupted by shutdown, returning the delivery to its queue"
                );
                if let Err(e) = feedback.nack(true).await {
                    error!(queue = %self.queue, "failed to nack delivery on cancellation: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// A worker that plays back a fixed sequence of results.
    struct Scripted {
        /// The results to return, in order. Once exhausted, attempts panic.
        script: Mutex<VecDeque<anyhow::Result<()>>>,
        /// How many times `handle` ran.
        calls: AtomicU32,
    }

    impl Scripted {
        /// Builds a worker from the given playback script.
        fn new(script: Vec<anyhow::Result<()>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            }
        }

        /// How many times the worker ran.
        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Worker for Scripted {
        type Message = ();

        async fn handle(&self, _message: &(), _cancel: &CancellationToken) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .expect("worker invoked more times than scripted")
        }
    }

    /// Options with the given strategy, budget and no delay.
    fn options(strategy: FailureStrategy, max_attempts: u32) -> WorkerOptions {
        WorkerOptions::new()
            .with_strategy(strategy)
            .with_max_attempts(max_attempts)
    }

    #[tokio::test]
    async fn first_attempt_success_completes() {
        let worker = Scripted::new(vec![Ok(())]);
        let outcome = run_attempts(
            &worker,
            &(),
            &options(FailureStrategy::Requeue, 1),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, Outcome::Completed { attempts: 1 });
        assert_eq!(worker.calls(), 1);
    }

    #[tokio::test]
    async fn retry_signal_earns_another_attempt() {
        let worker = Scripted::new(vec![Err(Signal::Retry.into()), Ok(())]);
        let opts = options(FailureStrategy::Requeue, 3)
            .with_retry_delay(Duration::from_millis(10));

        let started = Instant::now();
        let outcome = run_attempts(&worker, &(), &opts, &CancellationToken::new()).await;

        assert_eq!(outcome, Outcome::Completed { attempts: 2 });
        assert_eq!(worker.calls(), 2);
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn retry_strategy_exhausts_the_budget_then_discards() {
        let worker = Scripted::new(vec![
            Err(anyhow::anyhow!("boom")),
            Err(anyhow::anyhow!("boom again")),
        ]);
        let outcome = run_attempts(
            &worker,
            &(),
            &options(FailureStrategy::Retry, 2),
            &CancellationToken::new(),
        )
        .await;

        // Nothing asked for a requeue, so exhaustion falls through to discard.
        assert_eq!(outcome, Outcome::Discard { attempts: 2 });
        assert_eq!(worker.calls(), 2);
    }

    #[tokio::test]
    async fn requeue_strategy_exhausts_the_budget_then_requeues() {
        let worker = Scripted::new(vec![
            Err(anyhow::anyhow!("boom")),
            Err(anyhow::anyhow!("boom again")),
        ]);
        let outcome = run_attempts(
            &worker,
            &(),
            &options(FailureStrategy::Requeue, 2),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, Outcome::Requeue { attempts: 2 });
        assert_eq!(worker.calls(), 2);
    }

    #[tokio::test]
    async fn single_attempt_failures_requeue_under_the_default_strategy() {
        let worker = Scripted::new(vec![Err(anyhow::anyhow!("boom"))]);
        let outcome = run_attempts(
            &worker,
            &(),
            &options(FailureStrategy::Requeue, 1),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, Outcome::Requeue { attempts: 1 });
        assert_eq!(worker.calls(), 1);
    }

    #[tokio::test]
    async fn discard_strategy_gives_up_on_the_first_failure() {
        let worker = Scripted::new(vec![Err(anyhow::anyhow!("boom"))]);
        let outcome = run_attempts(
            &worker,
            &(),
            &options(FailureStrategy::Discard, 3),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, Outcome::Discard { attempts: 1 });
        assert_eq!(worker.calls(), 1);
    }

    #[tokio::test]
    async fn discard_signal_short_circuits_the_budget() {
        let worker = Scripted::new(vec![Err(Signal::Discard.into())]);
        let outcome = run_attempts(
            &worker,
            &(),
            &options(FailureStrategy::Retry, 5),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, Outcome::Discard { attempts: 1 });
        assert_eq!(worker.calls(), 1);
    }

    #[tokio::test]
    async fn requeue_signal_skips_remaining_attempts() {
        let worker = Scripted::new(vec![Err(Signal::Requeue.into())]);
        let outcome = run_attempts(
            &worker,
            &(),
            &options(FailureStrategy::Retry, 5),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, Outcome::Requeue { attempts: 1 });
        assert_eq!(worker.calls(), 1);
    }

    #[tokio::test]
    async fn strategy_none_discards_without_retrying() {
        let worker = Scripted::new(vec![Err(anyhow::anyhow!("boom"))]);
        let outcome = run_attempts(
            &worker,
            &(),
            &options(FailureStrategy::None, 3),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, Outcome::Discard { attempts: 1 });
    }

    #[tokio::test]
    async fn retry_signal_on_the_last_attempt_follows_the_strategy() {
        let worker = Scripted::new(vec![
            Err(Signal::Retry.into()),
            Err(Signal::Retry.into()),
        ]);
        let outcome = run_attempts(
            &worker,
            &(),
            &options(FailureStrategy::Requeue, 2),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, Outcome::Requeue { attempts: 2 });
    }

    #[tokio::test]
    async fn cancellation_during_the_retry_wait_requeues() {
        let worker = Scripted::new(vec![Err(Signal::Retry.into())]);
        let opts = options(FailureStrategy::Retry, 5).with_retry_delay(Duration::from_secs(30));

        let cancel = CancellationToken::new();
        let aborter = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            aborter.cancel();
        });

        let outcome = run_attempts(&worker, &(), &opts, &cancel).await;

        assert_eq!(outcome, Outcome::Cancelled);
        assert_eq!(worker.calls(), 1);
    }
}
