//! Cross-module tests: a [`MessageProcessor`] fed raw payloads end to end,
//! with the broker side stubbed out by detached ackers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lapin::acker::Acker;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::feedback::FeedbackSender;
use crate::rejection::{RejectReason, RejectionHandler};
use crate::worker::DeliveryProcessor;

use super::*;

/// The message type under test.
#[derive(Debug, Serialize, Deserialize)]
struct Tick {
    /// An arbitrary payload field.
    n: u32,
}

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
}

#[async_trait]
impl Worker for Scripted {
    type Message = Tick;

    async fn handle(&self, _message: &Tick, _cancel: &CancellationToken) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .expect("worker invoked more times than scripted")
    }
}

/// A rejection handler that records everything it sees.
#[derive(Default)]
struct Recording {
    /// The payload and rendered reason of every rejection.
    seen: Mutex<Vec<(Vec<u8>, String)>>,
}

impl Recording {
    /// A snapshot of the recorded rejections.
    fn rejections(&self) -> Vec<(Vec<u8>, String)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl RejectionHandler for Recording {
    async fn on_rejection(&self, payload: &[u8], reason: &RejectReason, queue: &str, vhost: &str) {
        assert_eq!(queue, "ticks");
        assert_eq!(vhost, "/");
        self.seen
            .lock()
            .unwrap()
            .push((payload.to_vec(), reason.to_string()));
    }
}

/// A feedback sender whose acker is detached from any channel.
fn feedback() -> FeedbackSender {
    FeedbackSender::from_parts(Acker::default(), 7, "ticks".into())
}

/// Builds a processor over the scripted worker and recording handler.
fn processor(
    worker: Scripted,
    rejection: Arc<Recording>,
    options: WorkerOptions,
) -> MessageProcessor<Scripted, JsonSerializer> {
    MessageProcessor::new(worker, JsonSerializer, rejection, options, "ticks", "/")
}

#[tokio::test]
async fn valid_payloads_reach_the_worker_once() {
    init_logging();
    let rejection = Arc::new(Recording::default());
    let processor = processor(
        Scripted::new(vec![Ok(())]),
        rejection.clone(),
        WorkerOptions::new(),
    );

    processor
        .process(br#"{"n":1}"#.to_vec(), feedback(), CancellationToken::new())
        .await;

    assert!(rejection.rejections().is_empty());
}

#[tokio::test]
async fn malformed_payloads_never_reach_the_worker() {
    init_logging();
    let rejection = Arc::new(Recording::default());
    let worker = Scripted::new(vec![]);
    let processor = processor(worker, rejection.clone(), WorkerOptions::new());

    processor
        .process(b"{not json".to_vec(), feedback(), CancellationToken::new())
        .await;

    // The scripted worker panics if invoked with an empty script, so reaching
    // this point proves it never ran.
    let rejections = rejection.rejections();
    assert_eq!(rejections.len(), 1);
    assert_eq!(rejections[0].0, b"{not json".to_vec());
    assert!(rejections[0].1.contains("undecodable"));
}

#[tokio::test]
async fn discard_signals_route_the_payload_to_the_rejection_handler() {
    init_logging();
    let rejection = Arc::new(Recording::default());
    let processor = processor(
        Scripted::new(vec![Err(Signal::Discard.into())]),
        rejection.clone(),
        WorkerOptions::new().with_max_attempts(5),
    );

    let payload = br#"{"n":2}"#.to_vec();
    processor
        .process(payload.clone(), feedback(), CancellationToken::new())
        .await;

    let rejections = rejection.rejections();
    assert_eq!(rejections.len(), 1);
    assert_eq!(rejections[0].0, payload);
    assert_eq!(rejections[0].1, "discarded after 1 attempt(s)");
}

#[tokio::test]
async fn requeued_messages_stay_away_from_the_rejection_handler() {
    init_logging();
    let rejection = Arc::new(Recording::default());
    let processor = processor(
        Scripted::new(vec![Err(anyhow::anyhow!("boom")), Err(anyhow::anyhow!("boom"))]),
        rejection.clone(),
        WorkerOptions::new()
            .with_strategy(FailureStrategy::Requeue)
            .with_max_attempts(2),
    );

    processor
        .process(br#"{"n":3}"#.to_vec(), feedback(), CancellationToken::new())
        .await;

    assert!(rejection.rejections().is_empty());
}

#[tokio::test]
async fn retries_wait_between_attempts() {
    init_logging();
    let rejection = Arc::new(Recording::default());
    let processor = processor(
        Scripted::new(vec![Err(Signal::Retry.into()), Ok(())]),
        rejection.clone(),
        WorkerOptions::new()
            .with_max_attempts(3)
            .with_retry_delay(Duration::from_millis(10)),
    );

    let started = std::time::Instant::now();
    processor
        .process(br#"{"n":4}"#.to_vec(), feedback(), CancellationToken::new())
        .await;

    assert!(started.elapsed() >= Duration::from_millis(10));
    assert!(rejection.rejections().is_empty());
}
