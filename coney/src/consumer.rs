//! The per-queue scaling loop and its subscriptions.
//!
//! A [`QueueConsumer`] owns a cooperative scaling task that periodically
//! observes the broker-reported queue depth and reconciles the set of active
//! subscriptions against the target its [`ConsumerCountManager`] computes.
//! Each subscription is a dedicated channel in manual-ack mode with a prefetch
//! of one, so the number of in-flight messages is exactly the number of active
//! subscriptions.
//!
//! A subscription moves through `Starting → Running → Draining → Closed`:
//! it starts when the scaling loop opens its channel and consumer, runs until
//! its token is cancelled (scale-down or stop) or its channel errors, then
//! drains by finishing the in-flight delivery, cancelling the broker-side
//! consumer and closing the channel.

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::Channel;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::feedback::FeedbackSender;
use crate::pool::ConnectionPool;
use crate::scaling::ConsumerCountManager;
use crate::worker::DeliveryProcessor;
use crate::Result;

/// State shared between the consumer handle and its scaling loop.
struct Shared {
    /// The queue this consumer drains.
    queue: String,
    /// The pool that vends channels for subscriptions and depth probes.
    pool: ConnectionPool,
    /// The processor every delivery is handed to.
    processor: Arc<dyn DeliveryProcessor>,
    /// The policy deciding how many subscriptions to run.
    count_manager: Arc<dyn ConsumerCountManager>,
    /// The number of active (non-draining) subscriptions, for observability.
    active: AtomicUsize,
    /// Whether `start` has been called without a matching `stop`.
    running: AtomicBool,
}

/// One active subscription: a dedicated channel with its own consumer and task.
struct Subscription {
    /// The consumer tag, unique per subscription.
    tag: String,
    /// The subscription's dedicated channel.
    channel: Channel,
    /// Child token of the consumer's root; cancelling it drains the subscription.
    token: CancellationToken,
    /// The task running [`subscription_task`].
    task: JoinHandle<()>,
}

/// The mutable run state behind the consumer handle.
struct RunState {
    /// The root cancellation token of the current run.
    root: CancellationToken,
    /// The scaling loop of the current run, if started.
    scaling_task: Option<JoinHandle<Vec<Subscription>>>,
}

/// A self-scaling consumer for one queue.
///
/// Construction is infallible and does no I/O; [`start`](QueueConsumer::start)
/// is the only operation that engages the broker. Once started, the consumer
/// keeps itself sized to the queue depth until [`stop`](QueueConsumer::stop).
pub struct QueueConsumer {
    /// State shared with the scaling loop.
    shared: Arc<Shared>,
    /// The current run's token and task handle.
    state: Mutex<RunState>,
}

impl QueueConsumer {
    /// Creates a consumer for the given queue. Does no I/O.
    pub fn new(
        pool: ConnectionPool,
        queue: impl Into<String>,
        processor: Arc<dyn DeliveryProcessor>,
        count_manager: Arc<dyn ConsumerCountManager>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: queue.into(),
                pool,
                processor,
                count_manager,
                active: AtomicUsize::new(0),
                running: AtomicBool::new(false),
            }),
            state: Mutex::new(RunState {
                root: CancellationToken::new(),
                scaling_task: None,
            }),
        }
    }

    /// The queue this consumer drains.
    pub fn queue_name(&self) -> &str {
        &self.shared.queue
    }

    /// How often the scaling loop re-evaluates its target.
    pub fn scale_interval(&self) -> Duration {
        self.shared.count_manager.scale_interval()
    }

    /// Whether the consumer is currently started.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// The number of active (non-draining) subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Starts the scaling loop. Idempotent while running.
    ///
    /// # Errors
    /// [`Error::BrokerUnreachable`](crate::Error::BrokerUnreachable) if no
    /// connection could be established within the pool's retry budget, and
    /// [`Error::PoolDisposed`](crate::Error::PoolDisposed) on a disposed pool.
    /// After a failed start the consumer is not running and may be started again.
    // The state mutex is only ever locked briefly; poisoning it means a panic
    // elsewhere already tore the process down.
    #[allow(clippy::missing_panics_doc)]
    pub async fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            debug!(queue = %self.shared.queue, "consumer already running");
            return Ok(());
        }

        // Fail fast if the broker cannot be reached at all; afterwards the
        // scaling loop absorbs transient connection trouble on its own.
        if let Err(e) = self.shared.pool.get_connection().await {
            self.shared.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let root = CancellationToken::new();
        let task = tokio::spawn(scaling_loop(self.shared.clone(), root.clone()));

        let mut state = self.state.lock().expect("consumer state lock poisoned");
        state.root = root;
        state.scaling_task = Some(task);

        info!(
            queue = %self.shared.queue,
            interval = ?self.scale_interval(),
            "consumer started"
        );
        Ok(())
    }

    /// Stops the consumer, waiting up to `grace` for in-flight deliveries.
    ///
    /// Deliveries that do not resolve in time are abandoned unacked; the broker
    /// redelivers them once their channels close. Idempotent; a no-op if the
    /// consumer is not running.
    // See `start` on the panic lint.
    #[allow(clippy::missing_panics_doc)]
    pub async fn stop(&self, grace: Duration) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!(queue = %self.shared.queue, grace = ?grace, "stopping consumer");

        let (root, scaling_task) = {
            let mut state = self.state.lock().expect("consumer state lock poisoned");
            (state.root.clone(), state.scaling_task.take())
        };
        root.cancel();

        let Some(mut scaling_task) = scaling_task else {
            return;
        };

        let deadline = tokio::time::Instant::now() + grace;
        let subscriptions = match tokio::time::timeout_at(deadline, &mut scaling_task).await {
            Ok(Ok(subscriptions)) => subscriptions,
            Ok(Err(e)) => {
                error!(queue = %self.shared.queue, "scaling loop panicked: {e:#}");
                Vec::new()
            }
            Err(_) => {
                // The subscription tasks observe the root token on their own,
                // so abandoning the loop here does not leave them running.
                warn!(queue = %self.shared.queue, "scaling loop did not wind down in time");
                scaling_task.abort();
                Vec::new()
            }
        };

        for subscription in subscriptions {
            let Subscription {
                tag,
                channel,
                mut task,
                ..
            } = subscription;

            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(consumer_tag = %tag, "subscription task panicked: {e:#}"),
                Err(_) => {
                    warn!(
                        consumer_tag = %tag,
                        "in-flight delivery did not resolve within the grace period; \
                         the broker will redeliver it"
                    );
                    task.abort();
                    if channel.status().connected() {
                        let _ = channel.close(200, "consumer stopped").await;
                    }
                }
            }
        }

        self.shared.active.store(0, Ordering::SeqCst);
        info!(queue = %self.shared.queue, "consumer stopped");
    }
}

/// Clamps a collection size into the scaling policy's domain.
fn saturating_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

/// The cooperative task that keeps the subscription set sized to the queue.
///
/// Returns the remaining subscriptions on shutdown so [`QueueConsumer::stop`]
/// can await their in-flight deliveries.
async fn scaling_loop(shared: Arc<Shared>, root: CancellationToken) -> Vec<Subscription> {
    let mut subscriptions: Vec<Subscription> = Vec::new();
    let mut draining: Vec<Subscription> = Vec::new();
    // The depth probe channel is never shared with a subscription.
    let mut probe: Option<Channel> = None;
    let mut ticker = tokio::time::interval(shared.count_manager.scale_interval());

    loop {
        tokio::select! {
            biased;
            _ = root.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // Reap subscriptions that retired on their own, e.g. on channel errors.
        subscriptions.retain(|subscription| {
            if subscription.task.is_finished() {
                debug!(consumer_tag = %subscription.tag, "subscription retired");
                false
            } else {
                true
            }
        });
        draining.retain(|subscription| !subscription.task.is_finished());

        let depth = match observe_depth(&shared, &mut probe).await {
            Ok(depth) => depth,
            Err(e) => {
                warn!(
                    queue = %shared.queue,
                    "could not observe queue depth, will retry on the next tick: {e:#}"
                );
                shared.active.store(subscriptions.len(), Ordering::SeqCst);
                continue;
            }
        };

        let active = saturating_u32(subscriptions.len());
        let target = shared.count_manager.target_scale(depth, active);
        let target_len = usize::try_from(target).unwrap_or(usize::MAX);

        if subscriptions.len() < target_len {
            debug!(queue = %shared.queue, depth, active, target, "scaling up");
            while subscriptions.len() < target_len {
                match open_subscription(&shared, &root).await {
                    Ok(subscription) => subscriptions.push(subscription),
                    Err(e) => {
                        warn!(
                            queue = %shared.queue,
                            "failed to open a subscription, will retry on the next tick: {e:#}"
                        );
                        break;
                    }
                }
            }
        } else if subscriptions.len() > target_len {
            debug!(queue = %shared.queue, depth, active, target, "scaling down");
            while subscriptions.len() > target_len {
                if let Some(subscription) = subscriptions.pop() {
                    debug!(consumer_tag = %subscription.tag, "draining subscription");
                    subscription.token.cancel();
                    draining.push(subscription);
                }
            }
        }

        shared.active.store(subscriptions.len(), Ordering::SeqCst);
    }

    if let Some(probe) = probe {
        let _ = probe.close(200, "consumer stopping").await;
    }

    // The subscriptions' tokens are children of the root, which is cancelled
    // by now; they are all draining. Hand them to `stop` to be awaited.
    shared.active.store(0, Ordering::SeqCst);
    subscriptions.append(&mut draining);
    subscriptions
}

/// Observes the queue depth with a passive declare on a cached probe channel.
async fn observe_depth(shared: &Shared, probe: &mut Option<Channel>) -> Result<u32> {
    let channel = match probe.as_ref().filter(|channel| channel.status().connected()) {
        Some(channel) => channel.clone(),
        None => {
            let channel = shared.pool.create_channel().await?;
            *probe = Some(channel.clone());
            channel
        }
    };

    let queue = channel
        .queue_declare(
            &shared.queue,
            QueueDeclareOptions {
                passive: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    Ok(queue.message_count())
}

/// Opens a channel, registers a manual-ack consumer with a prefetch of one,
/// and spawns the subscription's task.
async fn open_subscription(shared: &Arc<Shared>, root: &CancellationToken) -> Result<Subscription> {
    let channel = shared.pool.create_channel().await?;
    channel.basic_qos(1, BasicQosOptions::default()).await?;

    let tag = format!("{}-{}", shared.queue, Uuid::new_v4());
    let consumer = channel
        .basic_consume(
            &shared.queue,
            &tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    let token = root.child_token();
    let task = tokio::spawn(subscription_task(
        shared.clone(),
        channel.clone(),
        consumer,
        token.clone(),
        tag.clone(),
    ));

    debug!(queue = %shared.queue, consumer_tag = %tag, "subscription started");
    Ok(Subscription {
        tag,
        channel,
        token,
        task,
    })
}

/// Receives and processes deliveries one at a time until drained or the
/// channel fails, then cancels the broker-side consumer and closes the channel.
async fn subscription_task(
    shared: Arc<Shared>,
    channel: Channel,
    mut consumer: lapin::Consumer,
    token: CancellationToken,
    tag: String,
) {
    loop {
        let mut delivery = tokio::select! {
            // Check for draining before taking another delivery; an in-flight
            // message is always finished before the token is looked at again.
            biased;
            _ = token.cancelled() => break,
            delivery = consumer.next() => match delivery {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    error!(
                        queue = %shared.queue,
                        consumer_tag = %tag,
                        "error receiving delivery, retiring the subscription: {e}"
                    );
                    break;
                }
                // Only happens when the consumer is cancelled broker-side.
                None => {
                    warn!(
                        queue = %shared.queue,
                        consumer_tag = %tag,
                        "consumer cancelled by the broker, retiring the subscription"
                    );
                    break;
                }
            },
        };

        trace!(
            queue = %shared.queue,
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            "received delivery"
        );

        let body = mem::take(&mut delivery.data);
        let feedback = FeedbackSender::from_parts(
            mem::take(&mut delivery.acker),
            delivery.delivery_tag,
            shared.queue.clone(),
        );
        shared
            .processor
            .process(body, feedback, token.child_token())
            .await;
    }

    if channel.status().connected() {
        if let Err(e) = channel.basic_cancel(&tag, BasicCancelOptions::default()).await {
            warn!(consumer_tag = %tag, "failed to cancel the consumer during drain: {e}");
        }
        if let Err(e) = channel.close(200, "subscription closed").await {
            debug!(consumer_tag = %tag, "error closing the subscription channel: {e}");
        }
    }

    debug!(queue = %shared.queue, consumer_tag = %tag, "subscription closed");
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use crate::pool::PoolConfig;
    use crate::scaling::FixedCountManager;

    use super::*;

    /// A processor that acks everything. These tests never receive deliveries;
    /// it only exists so consumers can be constructed.
    struct AckAll;

    #[async_trait]
    impl DeliveryProcessor for AckAll {
        async fn process(
            &self,
            _body: Vec<u8>,
            feedback: FeedbackSender,
            _cancel: CancellationToken,
        ) {
            let _ = feedback.ack().await;
        }
    }

    /// A consumer over a pool pointing at nothing, with a tiny retry budget.
    fn unreachable_consumer() -> QueueConsumer {
        let pool = ConnectionPool::new(
            PoolConfig::new("amqp://127.0.0.1:1")
                .with_connect_timeout(Duration::from_millis(100)),
        );
        QueueConsumer::new(
            pool,
            "orders",
            Arc::new(AckAll),
            Arc::new(FixedCountManager::new(1, Duration::from_millis(50))),
        )
    }

    #[tokio::test]
    async fn construction_does_no_io() {
        let consumer = unreachable_consumer();
        assert!(!consumer.is_running());
        assert_eq!(consumer.active_subscriptions(), 0);
        assert_eq!(consumer.queue_name(), "orders");
        assert_eq!(consumer.scale_interval(), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn start_surfaces_broker_unreachable() {
        let consumer = unreachable_consumer();

        let err = consumer.start().await.unwrap_err();
        assert!(matches!(err, crate::Error::BrokerUnreachable(_)));
        // A failed start leaves the consumer stopped and startable again.
        assert!(!consumer.is_running());
    }

    #[tokio::test]
    async fn start_on_a_disposed_pool_fails() {
        let pool = ConnectionPool::new(PoolConfig::new("amqp://127.0.0.1:1"));
        pool.dispose().await;

        let consumer = QueueConsumer::new(
            pool,
            "orders",
            Arc::new(AckAll),
            Arc::new(FixedCountManager::new(1, Duration::from_secs(1))),
        );

        assert!(matches!(
            consumer.start().await,
            Err(crate::Error::PoolDisposed)
        ));
        assert!(!consumer.is_running());
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let consumer = unreachable_consumer();
        consumer.stop(Duration::from_secs(1)).await;
        assert!(!consumer.is_running());
    }
}
