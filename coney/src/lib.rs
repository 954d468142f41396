//! # coney
//!
//! A self-scaling consumer library for AMQP built on top of [lapin](https://github.com/amqp-rs/lapin).
//!
//! coney drains a named queue through a pool of per-channel subscriptions that
//! grows and shrinks with the broker-reported queue depth. Every delivery is
//! decoded by a pluggable serializer (JSON by default) and handed to a typed
//! [`Worker`]; the worker's outcome, together with its retry policy and any
//! [`Signal`] its errors carry, decides whether the delivery is acked,
//! requeued or discarded to a rejection handler.

// Nothing in this crate needs raw pointers or FFI.
#![forbid(unsafe_code)]
#![warn(
    // The crate is mostly small policy types (strategies, configs, signals)
    // whose intent is easy to lose track of. Require docs everywhere,
    // private items included, so each one says what it is for.
    missing_docs,
    clippy::missing_docs_in_private_items,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,

    // Keeps the dependency table in Cargo.toml honest.
    unused_crate_dependencies,

    // Queue depths and subscription counts cross between the broker's u32
    // and collection usizes. `as` would truncate silently on the way back,
    // so conversions have to go through `From`/`TryFrom`.
    clippy::as_conversions,
)]

// lapin types (Channel, ExchangeKind, declare options) appear in this crate's
// public API, so the exact lapin version is re-exported rather than making
// users pin a matching one themselves.
pub use lapin;

// Workers and custom processors receive these tokens, so the same applies.
pub use tokio_util::sync::CancellationToken;

pub mod client;
pub mod consumer;
pub mod error;
pub mod feedback;
pub mod pool;
pub mod queue_config;
pub mod rejection;
pub mod scaling;
pub mod serializer;
pub mod worker;

// The main names are flattened into the crate root, so callers write
// `coney::QueueClient` instead of `coney::client::QueueClient`.
pub use client::QueueClient;
pub use client::QueueInfo;
pub use consumer::QueueConsumer;
pub use error::Error;
pub use error::FeedbackError;
pub use error::SerializerError;
pub use error::Signal;
pub use feedback::FeedbackSender;
pub use pool::ConnectionPool;
pub use pool::PoolConfig;
pub use queue_config::QueueConfig;
pub use rejection::DiscardingRejectionHandler;
pub use rejection::PublishingRejectionHandler;
pub use rejection::RejectReason;
pub use rejection::RejectionHandler;
pub use scaling::ConsumerCountManager;
pub use scaling::CountManagerConfig;
pub use scaling::DepthRatioCountManager;
pub use scaling::FixedCountManager;
pub use serializer::JsonSerializer;
pub use serializer::Serializer;
pub use worker::DeliveryProcessor;
pub use worker::FailureStrategy;
pub use worker::MessageProcessor;
pub use worker::Worker;
pub use worker::WorkerOptions;

/// Convenience type for a result with `coney`'s error.
pub type Result<T> = std::result::Result<T, Error>;
