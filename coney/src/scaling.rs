//! Policies deciding how many subscriptions a consumer should run.

use std::time::Duration;

/// Decides the target number of concurrent subscriptions for a queue.
///
/// Implementations are pure policy: the consumer observes the queue depth via a
/// passive declare and supplies it here, so `target_scale` must never block on
/// I/O of its own.
pub trait ConsumerCountManager: Send + Sync + 'static {
    /// The number of subscriptions the consumer should be running, given the
    /// broker-reported queue depth and the currently active count.
    fn target_scale(&self, queue_depth: u32, current_active: u32) -> u32;

    /// How often the consumer re-evaluates the target.
    fn scale_interval(&self) -> Duration;
}

/// Configuration for [`DepthRatioCountManager`].
#[derive(Debug, Clone)]
pub struct CountManagerConfig {
    /// The floor for the subscription count while the broker is healthy.
    pub(crate) min_consumers: u32,
    /// The ceiling for the subscription count.
    pub(crate) max_consumers: u32,
    /// How many queued messages warrant one subscription.
    pub(crate) messages_per_consumer: u32,
    /// How often the consumer re-evaluates the target.
    pub(crate) scale_interval: Duration,
}

impl CountManagerConfig {
    /// The default subscription floor.
    pub const DEFAULT_MIN_CONSUMERS: u32 = 1;

    /// The default subscription ceiling.
    pub const DEFAULT_MAX_CONSUMERS: u32 = 10;

    /// The default queued-messages-per-subscription ratio.
    pub const DEFAULT_MESSAGES_PER_CONSUMER: u32 = 10;

    /// The default re-evaluation interval.
    pub const DEFAULT_SCALE_INTERVAL: Duration = Duration::from_secs(10);

    /// Creates the default configuration.
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the subscription floor.
    ///
    /// # Panics
    /// Panics if `min` exceeds the configured maximum.
    pub fn with_min_consumers(mut self, min: u32) -> Self {
        assert!(
            min <= self.max_consumers,
            "min_consumers ({min}) must not exceed max_consumers ({})",
            self.max_consumers
        );
        self.min_consumers = min;
        self
    }

    /// Sets the subscription ceiling.
    ///
    /// # Panics
    /// Panics if `max` is below the configured minimum.
    pub fn with_max_consumers(mut self, max: u32) -> Self {
        assert!(
            max >= self.min_consumers,
            "max_consumers ({max}) must not be below min_consumers ({})",
            self.min_consumers
        );
        self.max_consumers = max;
        self
    }

    /// Sets how many queued messages warrant one subscription.
    ///
    /// # Panics
    /// Panics if `ratio` is zero.
    pub fn with_messages_per_consumer(mut self, ratio: u32) -> Self {
        assert!(ratio >= 1, "messages_per_consumer must be at least 1");
        self.messages_per_consumer = ratio;
        self
    }

    /// Sets how often the consumer re-evaluates the target.
    ///
    /// # Panics
    /// Panics if `interval` is zero.
    pub fn with_scale_interval(mut self, interval: Duration) -> Self {
        assert!(!interval.is_zero(), "scale_interval must be positive");
        self.scale_interval = interval;
        self
    }
}

impl Default for CountManagerConfig {
    fn default() -> Self {
        Self {
            min_consumers: Self::DEFAULT_MIN_CONSUMERS,
            max_consumers: Self::DEFAULT_MAX_CONSUMERS,
            messages_per_consumer: Self::DEFAULT_MESSAGES_PER_CONSUMER,
            scale_interval: Self::DEFAULT_SCALE_INTERVAL,
        }
    }
}

/// Scales the subscription count with the queue depth.
///
/// The target is the queue depth divided by the messages-per-consumer ratio,
/// rounded up and clamped into `[min_consumers, max_consumers]`.
#[derive(Debug, Clone)]
pub struct DepthRatioCountManager {
    /// The bounds and ratio driving the policy.
    config: CountManagerConfig,
}

impl DepthRatioCountManager {
    /// Creates a manager with the given configuration.
    pub fn new(config: CountManagerConfig) -> Self {
        Self { config }
    }
}

impl Default for DepthRatioCountManager {
    fn default() -> Self {
        Self::new(CountManagerConfig::default())
    }
}

impl ConsumerCountManager for DepthRatioCountManager {
    fn target_scale(&self, queue_depth: u32, _current_active: u32) -> u32 {
        let ratio = self.config.messages_per_consumer;
        // Ceiling division without overflowing on depth == u32::MAX.
        let needed = queue_depth / ratio + u32::from(queue_depth % ratio != 0);
        needed.clamp(self.config.min_consumers, self.config.max_consumers)
    }

    fn scale_interval(&self) -> Duration {
        self.config.scale_interval
    }
}

/// A degenerate policy that always targets the same subscription count.
///
/// Equivalent to [`DepthRatioCountManager`] with `min == max`, but states the
/// intent directly.
#[derive(Debug, Clone)]
pub struct FixedCountManager {
    /// The constant target.
    count: u32,
    /// How often the consumer re-checks (to recreate retired subscriptions).
    scale_interval: Duration,
}

impl FixedCountManager {
    /// Creates a policy that always targets `count` subscriptions.
    pub fn new(count: u32, scale_interval: Duration) -> Self {
        Self {
            count,
            scale_interval,
        }
    }
}

impl ConsumerCountManager for FixedCountManager {
    fn target_scale(&self, _queue_depth: u32, _current_active: u32) -> u32 {
        self.count
    }

    fn scale_interval(&self) -> Duration {
        self.scale_interval
    }
}
