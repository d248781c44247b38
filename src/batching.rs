//! C4: batching consumer / worker harness, spec.md §4.2.
//!
//! The batch-accumulation shape (`add`/`should_flush`/`take`) is lifted
//! directly from `siem_consumer::EventBatch`; the retry-with-backoff-and-
//! jitter used for a failing `flush_batch` is grounded in
//! `siem_unified_pipeline::v2::util::retry::retry_idempotent`, adapted to
//! the spec's exact parameters (retry forever, base 250 ms, cap 5 s,
//! jitter ±20%) instead of a bounded attempt count.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::broker::{Consumer, ConsumerError, Message, Partition, PollOutcome, RebalanceEvent};
use crate::metrics::MetricsBackend;
use crate::Result;

/// User-supplied processing + flush logic. `process_message` is a fallible
/// pure transform (`Ok(None)` filters, `Err` is a recoverable decode error
/// unless `is_fatal()` returns true on the error); `flush_batch` is the
/// side-effecting commit of the accumulated batch to downstream storage.
#[async_trait::async_trait]
pub trait Worker<TIn, TOut>: Send {
    fn process_message(&mut self, message: Message<TIn>) -> Result<Option<TOut>>;

    async fn flush_batch(&mut self, batch: Vec<TOut>) -> Result<()>;
}

struct BatchState<TOut> {
    items: Vec<TOut>,
    offsets_to_commit: HashMap<Partition, u64>,
    first_item_at: Option<Instant>,
}

impl<TOut> Default for BatchState<TOut> {
    fn default() -> Self {
        BatchState {
            items: Vec::new(),
            offsets_to_commit: HashMap::new(),
            first_item_at: None,
        }
    }
}

impl<TOut> BatchState<TOut> {
    fn record_offset(&mut self, partition: Partition, next_offset: u64) {
        self.offsets_to_commit.insert(partition, next_offset);
    }

    fn push(&mut self, item: TOut) {
        if self.first_item_at.is_none() {
            self.first_item_at = Some(Instant::now());
        }
        self.items.push(item);
    }

    fn should_flush(&self, max_batch_size: usize, max_batch_time: Duration) -> bool {
        self.items.len() >= max_batch_size
            || self
                .first_item_at
                .map(|t| t.elapsed() >= max_batch_time)
                .unwrap_or(false)
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty() && self.offsets_to_commit.is_empty()
    }

    fn take(&mut self) -> (Vec<TOut>, HashMap<Partition, u64>) {
        self.first_item_at = None;
        (std::mem::take(&mut self.items), std::mem::take(&mut self.offsets_to_commit))
    }
}

/// Exponential backoff with jitter for the flush retry loop: base 250 ms,
/// cap 5 s, jitter ±20%, per spec.md §4.2 "Failure policy".
fn backoff_for_attempt(attempt: u32) -> Duration {
    let base_ms = 250u64.saturating_mul(1u64 << attempt.min(20));
    let capped_ms = base_ms.min(5_000);
    let jitter_range = (capped_ms as f64 * 0.2) as i64;
    let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
    let final_ms = (capped_ms as i64 + jitter).max(0) as u64;
    Duration::from_millis(final_ms)
}

/// Thread-safe shutdown flag, read only from the poll thread, per spec.md
/// §9 "Signal-driven shutdown".
#[derive(Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_signaled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct BatchingConsumer<TIn, TOut, W: Worker<TIn, TOut>> {
    consumer: Box<dyn Consumer<TIn>>,
    worker: W,
    max_batch_size: usize,
    max_batch_time: Duration,
    poll_timeout: Duration,
    metrics: Arc<dyn MetricsBackend>,
    shutdown: ShutdownHandle,
    batch: BatchState<TOut>,
    _marker: std::marker::PhantomData<TIn>,
}

impl<TIn, TOut, W> BatchingConsumer<TIn, TOut, W>
where
    W: Worker<TIn, TOut>,
    TOut: Clone,
{
    pub fn new(
        consumer: Box<dyn Consumer<TIn>>,
        worker: W,
        max_batch_size: usize,
        max_batch_time: Duration,
        metrics: Arc<dyn MetricsBackend>,
    ) -> Self {
        BatchingConsumer {
            consumer,
            worker,
            max_batch_size,
            max_batch_time,
            poll_timeout: Duration::from_secs(1),
            metrics,
            shutdown: ShutdownHandle::new(),
            batch: BatchState::default(),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Runs until a shutdown signal or a fatal error. Returns `Ok(())` on
    /// clean shutdown.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            if self.shutdown.is_signaled() {
                self.flush(true).await?;
                self.consumer.close();
                return Ok(());
            }

            match self.consumer.poll(self.poll_timeout) {
                Ok(outcome) => {
                    // Rebalance events observed during this poll: flush
                    // immediately with whatever is batched before revoked
                    // partitions leave (spec.md §4.2 step 5).
                    let events = self.consumer.drain_rebalance_events();
                    let has_revoke = events
                        .iter()
                        .any(|e| matches!(e, RebalanceEvent::Revoked(_)));
                    if has_revoke && !self.batch.is_empty() {
                        self.flush(false).await?;
                    }

                    match outcome {
                        PollOutcome::Message(message) => {
                            let partition = message.partition.clone();
                            let next_offset = message.next_offset();
                            match self.worker.process_message(message) {
                                Ok(Some(item)) => {
                                    self.batch.push(item);
                                }
                                Ok(None) => {}
                                Err(e) if e.is_fatal() => {
                                    return Err(e);
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "dropping message after decode error");
                                    self.metrics.increment("consumer.decode_error", 1, &[]);
                                }
                            }
                            // Offset commits regardless of whether the
                            // message was filtered, parsed into a batch
                            // item, or dropped after a decode error — a
                            // stuck partition would otherwise never
                            // advance past a poison message.
                            self.batch.record_offset(partition, next_offset);
                        }
                        PollOutcome::EndOfPartition(_) | PollOutcome::Timeout => {}
                    }

                    if self.batch.should_flush(self.max_batch_size, self.max_batch_time) {
                        self.flush(false).await?;
                    }
                }
                Err(ConsumerError::Fatal(msg)) => {
                    tracing::error!(error = %msg, "fatal broker error, aborting after final flush");
                    self.flush(true).await.ok();
                    self.consumer.close();
                    return Err(crate::Error::InvariantViolation(msg));
                }
                Err(ConsumerError::Transient(msg)) => {
                    tracing::warn!(error = %msg, "transient broker error, retrying poll");
                }
            }
        }
    }

    /// Flushes the current batch. `force` flushes even an empty batch
    /// (used for the shutdown-time final flush, so staged-but-uncommitted
    /// offsets still commit).
    async fn flush(&mut self, force: bool) -> Result<()> {
        if self.batch.is_empty() && !force {
            return Ok(());
        }

        let (items, offsets) = self.batch.take();
        let batch_size = items.len();

        // Offsets are not committed until flush succeeds, per spec.md
        // §4.2: "this is the correctness load-bearing choice."
        let mut attempt = 0u32;
        loop {
            match self.worker.flush_batch(items.clone()).await {
                Ok(()) => break,
                Err(e) => {
                    self.metrics.increment("consumer.flush_error", 1, &[]);
                    let delay = backoff_for_attempt(attempt);
                    tracing::error!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "flush_batch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }

        if !offsets.is_empty() {
            self.consumer
                .stage_offsets(offsets)
                .map_err(|e| crate::Error::InvariantViolation(e.to_string()))?;
            self.consumer
                .commit_offsets()
                .map_err(|e| crate::Error::InvariantViolation(e.to_string()))?;
        }

        self.metrics.timing("consumer.batch_size", batch_size as i64, &[]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{FakeBroker, FakeConsumer, FakeProducer, KafkaPayload, PassthroughCodec, Topic};
    use crate::metrics::TestMetrics;
    use std::sync::Mutex as StdMutex;

    struct CountingWorker {
        flushes: Arc<StdMutex<Vec<usize>>>,
        shutdown: ShutdownHandle,
        seen: usize,
        total: usize,
    }

    #[async_trait::async_trait]
    impl Worker<KafkaPayload, u8> for CountingWorker {
        fn process_message(&mut self, message: Message<KafkaPayload>) -> Result<Option<u8>> {
            self.seen += 1;
            if self.seen == self.total {
                self.shutdown.signal();
            }
            Ok(message.payload.value.first().copied())
        }

        async fn flush_batch(&mut self, batch: Vec<u8>) -> Result<()> {
            self.flushes.lock().unwrap().push(batch.len());
            Ok(())
        }
    }

    #[tokio::test]
    async fn batches_of_three_then_a_final_remainder() {
        let broker = FakeBroker::new();
        let topic = Topic::new("events");
        broker.create_topic(&topic, 1);

        let codec: Arc<dyn crate::broker::Codec<KafkaPayload, KafkaPayload> + Send + Sync> =
            Arc::new(PassthroughCodec);
        let producer = FakeProducer::new(broker.clone(), codec.clone());
        for i in 0..10u8 {
            producer
                .produce(crate::broker::Destination::Topic(topic.clone()), KafkaPayload::new(None, vec![i]))
                .await
                .unwrap();
        }

        let mut consumer: FakeConsumer<KafkaPayload> = FakeConsumer::new(broker, codec, false);
        consumer.subscribe(&[topic]).unwrap();

        let flushes = Arc::new(StdMutex::new(Vec::new()));
        let metrics: Arc<dyn MetricsBackend> = Arc::new(TestMetrics::new());
        let mut harness = BatchingConsumer::new(
            Box::new(consumer),
            CountingWorker {
                flushes: flushes.clone(),
                shutdown: ShutdownHandle::new(),
                seen: 0,
                total: 10,
            },
            3,
            Duration::from_secs(60),
            metrics,
        );
        // The worker signals its own handle once it has seen every
        // produced message, so run() performs the shutdown-time final
        // flush right after the tenth message lands in the batch.
        harness.worker.shutdown = harness.shutdown_handle();

        harness.run().await.unwrap();

        assert_eq!(*flushes.lock().unwrap(), vec![3, 3, 3, 1]);
    }

    #[test]
    fn backoff_is_bounded_and_jittered() {
        for attempt in 0..10 {
            let d = backoff_for_attempt(attempt);
            assert!(d.as_millis() <= 6_000);
        }
    }
}
