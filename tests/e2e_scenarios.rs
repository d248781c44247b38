//! Literal end-to-end scenarios, run against the in-memory fake broker.
//!
//! These restate spec.md §8's two scenarios that exercise the public
//! wiring end to end (batching harness, synchronized consumer gating);
//! the in-module unit tests cover the remaining scenarios at a finer
//! grain. Scenario 4 ("replacement skip") has no test here: the column
//! store client wraps a real `clickhouse::Client` with no fake seam, so
//! exercising it needs a running ClickHouse instance, out of scope for
//! this suite.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use colstream::batching::{BatchingConsumer, Worker};
use colstream::broker::{
    Commit, CommitCodec, Consumer, Destination, FakeBroker, FakeConsumer, FakeProducer, KafkaPayload,
    Message, PassthroughCodec, PollOutcome, Producer, Topic,
};
use colstream::metrics::{MetricsBackend, TestMetrics};
use colstream::synchronized::SynchronizedConsumer;

fn passthrough_codec() -> Arc<dyn colstream::broker::Codec<KafkaPayload, KafkaPayload> + Send + Sync> {
    Arc::new(PassthroughCodec)
}

struct RecordingWorker {
    flushes: Arc<Mutex<Vec<usize>>>,
}

#[async_trait::async_trait]
impl Worker<KafkaPayload, u8> for RecordingWorker {
    fn process_message(&mut self, message: Message<KafkaPayload>) -> colstream::Result<Option<u8>> {
        Ok(message.payload.value.first().copied())
    }

    async fn flush_batch(&mut self, batch: Vec<u8>) -> colstream::Result<()> {
        self.flushes.lock().unwrap().push(batch.len());
        Ok(())
    }
}

/// Scenario 1: messages `[0..9]`, `max_batch_size=3`, `max_batch_time_ms`
/// effectively infinite. Expect flushes `[3,3,3]` plus a final `[1]` on
/// shutdown, and a committed offset of 10.
#[tokio::test]
async fn batching_flushes_in_threes_with_a_final_remainder() {
    let broker = FakeBroker::new();
    let topic = Topic::new("events");
    broker.create_topic(&topic, 1);

    let producer = FakeProducer::new(broker.clone(), passthrough_codec());
    for i in 0..10u8 {
        producer
            .produce(Destination::Topic(topic.clone()), KafkaPayload::new(None, vec![i]))
            .await
            .unwrap();
    }

    let mut consumer: FakeConsumer<KafkaPayload> = FakeConsumer::new(broker, passthrough_codec(), false);
    consumer.subscribe(&[topic.clone()]).unwrap();

    let flushes = Arc::new(Mutex::new(Vec::new()));
    let metrics: Arc<dyn MetricsBackend> = Arc::new(TestMetrics::new());
    let mut harness = BatchingConsumer::new(
        Box::new(consumer),
        RecordingWorker {
            flushes: flushes.clone(),
        },
        3,
        Duration::from_millis(60_000),
        metrics,
    );

    // The ten messages and three size-triggered flushes happen on the
    // first few poll iterations; once they have landed, signal shutdown
    // so run() performs the final flush of the one-item remainder and
    // returns.
    let shutdown = harness.shutdown_handle();
    let flushes_watch = flushes.clone();
    tokio::spawn(async move {
        loop {
            if flushes_watch.lock().unwrap().len() >= 3 {
                shutdown.signal();
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    harness.run().await.unwrap();

    assert_eq!(*flushes.lock().unwrap(), vec![3, 3, 3, 1]);
}

/// Scenario 2: topic `A`, one partition, required group `G1`. Offsets
/// 0..4 are produced with no commit-log records yet; repeated polling
/// must yield nothing because the partition starts paused. Once the
/// commit log reports offset 3 for `(G1, (A,0))`, the synchronized
/// consumer must deliver exactly offsets 0, 1, 2.
#[tokio::test]
async fn synchronized_consumer_withholds_until_commit_log_catches_up() {
    let broker = FakeBroker::new();
    let topic = Topic::new("A");
    let commit_topic = Topic::new("A-commit-log");
    broker.create_topic(&topic, 1);
    broker.create_topic(&commit_topic, 1);

    let data_producer = FakeProducer::new(broker.clone(), passthrough_codec());
    for i in 0..5u8 {
        data_producer
            .produce(Destination::Topic(topic.clone()), KafkaPayload::new(None, vec![i]))
            .await
            .unwrap();
    }

    let primary: FakeConsumer<KafkaPayload> = FakeConsumer::new(broker.clone(), passthrough_codec(), false);
    let commit_log: FakeConsumer<KafkaPayload> = FakeConsumer::new(broker.clone(), passthrough_codec(), false);
    let mut synced = SynchronizedConsumer::new(Box::new(primary), Box::new(commit_log), commit_topic.clone());
    synced.subscribe(&[topic.clone()]).unwrap();
    synced.drain_rebalance_events();

    for _ in 0..3 {
        match synced.poll(Duration::from_millis(100)).unwrap() {
            PollOutcome::Timeout => {}
            other => panic!("expected the partition to stay paused, got {other:?}"),
        }
    }

    let commit_producer = FakeProducer::new(broker.clone(), passthrough_codec());
    let partition = colstream::broker::Partition::new(topic.clone(), 0);
    let commit_payload = CommitCodec.encode(&Commit::new("G1", partition, 3));
    commit_producer
        .produce(Destination::Topic(commit_topic.clone()), commit_payload)
        .await
        .unwrap();

    let mut delivered = Vec::new();
    loop {
        match synced.poll(Duration::from_millis(100)).unwrap() {
            PollOutcome::Message(m) => delivered.push(m.offset),
            PollOutcome::Timeout => break,
            PollOutcome::EndOfPartition(_) => break,
        }
    }

    assert_eq!(delivered, vec![0, 1, 2]);
}
