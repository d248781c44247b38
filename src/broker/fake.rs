//! In-memory `Consumer`/`Producer` implementation used to drive the
//! end-to-end scenarios in spec.md §8 without a running broker.
//!
//! Grounded in `tests/utils/streams/test_kafka.py`'s
//! `FakeConfluentKafkaProducer` and the `StreamsTestMixin` test harness in
//! the original implementation: a shared append-only log per partition, a
//! producer that appends to it, and a consumer that tracks its own
//! per-partition read cursor against that log.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use super::consumer::{Consumer, ConsumerError, EndOfPartition, PollOutcome, RebalanceEvent};
use super::producer::{Destination, ProduceFuture, Producer};
use super::types::{Codec, KafkaPayload, Message, Partition, Topic};

#[derive(Default)]
struct FakeLog {
    // partition -> append-only records
    records: HashMap<Partition, Vec<KafkaPayload>>,
    partition_counts: HashMap<Topic, u16>,
}

/// Shared in-memory broker state. Clone to hand a second handle to a
/// producer and consumer that should see the same data (e.g. a primary
/// topic and its commit log in the same test).
#[derive(Clone, Default)]
pub struct FakeBroker {
    log: Arc<Mutex<FakeLog>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_topic(&self, topic: &Topic, partitions: u16) {
        let mut log = self.log.lock().unwrap();
        log.partition_counts.insert(topic.clone(), partitions);
        for idx in 0..partitions {
            log.records
                .entry(Partition::new(topic.clone(), idx))
                .or_default();
        }
    }

    fn append(&self, destination: &Destination, payload: KafkaPayload) -> Partition {
        let mut log = self.log.lock().unwrap();
        let partition = match destination {
            Destination::Partition(p) => p.clone(),
            Destination::Topic(t) => {
                let count = *log.partition_counts.get(t).unwrap_or(&1);
                // Single-partition topics (the common case in these
                // scenarios) always land on index 0; the fake is not a
                // faithful partitioner for multi-partition topics.
                let _ = count;
                Partition::new(t.clone(), 0)
            }
        };
        log.records.entry(partition.clone()).or_default().push(payload);
        partition
    }

    fn len(&self, partition: &Partition) -> u64 {
        self.log
            .lock()
            .unwrap()
            .records
            .get(partition)
            .map(|v| v.len() as u64)
            .unwrap_or(0)
    }

    fn get(&self, partition: &Partition, offset: u64) -> Option<KafkaPayload> {
        self.log
            .lock()
            .unwrap()
            .records
            .get(partition)
            .and_then(|v| v.get(offset as usize))
            .cloned()
    }

    fn partitions_for_topic(&self, topic: &Topic) -> Vec<Partition> {
        let count = *self
            .log
            .lock()
            .unwrap()
            .partition_counts
            .get(topic)
            .unwrap_or(&1);
        (0..count).map(|i| Partition::new(topic.clone(), i)).collect()
    }
}

pub struct FakeConsumer<P> {
    broker: FakeBroker,
    codec: Arc<dyn Codec<KafkaPayload, P> + Send + Sync>,
    assigned: HashMap<Partition, u64>,
    paused: HashSet<Partition>,
    staged: HashMap<Partition, u64>,
    committed: HashMap<Partition, u64>,
    enable_end_of_partition: bool,
    reported_eof: HashSet<Partition>,
    pending_rebalance: Vec<RebalanceEvent>,
}

impl<P> FakeConsumer<P> {
    pub fn new(
        broker: FakeBroker,
        codec: Arc<dyn Codec<KafkaPayload, P> + Send + Sync>,
        enable_end_of_partition: bool,
    ) -> Self {
        FakeConsumer {
            broker,
            codec,
            assigned: HashMap::new(),
            paused: HashSet::new(),
            staged: HashMap::new(),
            committed: HashMap::new(),
            enable_end_of_partition,
            reported_eof: HashSet::new(),
            pending_rebalance: Vec::new(),
        }
    }
}

impl<P: Send> Consumer<P> for FakeConsumer<P> {
    fn subscribe(&mut self, topics: &[Topic]) -> Result<(), ConsumerError> {
        let mut mapping = HashMap::new();
        for topic in topics {
            for partition in self.broker.partitions_for_topic(topic) {
                mapping.insert(partition, 0);
            }
        }
        self.assigned = mapping.clone();
        self.pending_rebalance.push(RebalanceEvent::Assigned(mapping));
        Ok(())
    }

    fn unsubscribe(&mut self) -> Result<(), ConsumerError> {
        let revoked: Vec<Partition> = self.assigned.keys().cloned().collect();
        self.assigned.clear();
        self.pending_rebalance.push(RebalanceEvent::Revoked(revoked));
        Ok(())
    }

    fn poll(&mut self, _timeout: Duration) -> Result<PollOutcome<P>, ConsumerError> {
        let candidates: Vec<Partition> = self
            .assigned
            .keys()
            .filter(|p| !self.paused.contains(*p))
            .cloned()
            .collect();

        for partition in candidates {
            let offset = self.assigned[&partition];
            let len = self.broker.len(&partition);
            if offset >= len {
                if self.enable_end_of_partition && !self.reported_eof.contains(&partition) {
                    self.reported_eof.insert(partition.clone());
                    return Ok(PollOutcome::EndOfPartition(EndOfPartition {
                        partition,
                        offset,
                    }));
                }
                continue;
            }
            self.reported_eof.remove(&partition);
            if let Some(payload) = self.broker.get(&partition, offset) {
                let decoded = self
                    .codec
                    .decode(payload)
                    .map_err(|e| ConsumerError::Fatal(e.to_string()))?;
                self.assigned.insert(partition.clone(), offset + 1);
                return Ok(PollOutcome::Message(Message::new(
                    partition,
                    offset,
                    decoded,
                    SystemTime::now(),
                )));
            }
        }
        Ok(PollOutcome::Timeout)
    }

    fn drain_rebalance_events(&mut self) -> Vec<RebalanceEvent> {
        std::mem::take(&mut self.pending_rebalance)
    }

    fn pause(&mut self, partitions: &[Partition]) -> Result<(), ConsumerError> {
        self.paused.extend(partitions.iter().cloned());
        Ok(())
    }

    fn resume(&mut self, partitions: &[Partition]) -> Result<(), ConsumerError> {
        for p in partitions {
            self.paused.remove(p);
        }
        Ok(())
    }

    fn paused(&self) -> HashSet<Partition> {
        self.paused.clone()
    }

    fn tell(&self) -> HashMap<Partition, u64> {
        self.assigned.clone()
    }

    fn seek(&mut self, offsets: HashMap<Partition, u64>) -> Result<(), ConsumerError> {
        for (p, o) in offsets {
            self.assigned.insert(p, o);
        }
        Ok(())
    }

    fn stage_offsets(&mut self, offsets: HashMap<Partition, u64>) -> Result<(), ConsumerError> {
        self.staged.extend(offsets);
        Ok(())
    }

    fn commit_offsets(&mut self) -> Result<HashMap<Partition, u64>, ConsumerError> {
        self.committed.extend(self.staged.drain());
        Ok(self.committed.clone())
    }

    fn close(&mut self) {
        self.assigned.clear();
    }
}

pub struct FakeProducer<P> {
    broker: FakeBroker,
    codec: Arc<dyn Codec<KafkaPayload, P> + Send + Sync>,
}

impl<P> FakeProducer<P> {
    pub fn new(broker: FakeBroker, codec: Arc<dyn Codec<KafkaPayload, P> + Send + Sync>) -> Self {
        FakeProducer { broker, codec }
    }
}

impl<P: Clone + Send + Sync + 'static> Producer<P> for FakeProducer<P> {
    fn produce(&self, destination: Destination, payload: P) -> ProduceFuture<P> {
        let encoded = self.codec.encode(payload.clone());
        let partition = self.broker.append(&destination, encoded);
        let offset = self.broker.len(&partition).saturating_sub(1);
        Box::pin(async move { Ok(Message::new(partition, offset, payload, SystemTime::now())) })
    }

    fn close(&self, _timeout: Duration) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::types::PassthroughCodec;

    fn passthrough() -> Arc<dyn Codec<KafkaPayload, KafkaPayload> + Send + Sync> {
        Arc::new(PassthroughCodec)
    }

    #[tokio::test]
    async fn produced_messages_are_delivered_in_order() {
        let broker = FakeBroker::new();
        let topic = Topic::new("events");
        broker.create_topic(&topic, 1);

        let producer = FakeProducer::new(broker.clone(), passthrough());
        for i in 0..3u8 {
            producer
                .produce(
                    Destination::Topic(topic.clone()),
                    KafkaPayload::new(None, vec![i]),
                )
                .await
                .unwrap();
        }

        let mut consumer: FakeConsumer<KafkaPayload> =
            FakeConsumer::new(broker, passthrough(), false);
        consumer.subscribe(&[topic]).unwrap();

        for i in 0..3u8 {
            match consumer.poll(Duration::from_millis(10)).unwrap() {
                PollOutcome::Message(m) => {
                    assert_eq!(m.offset, i as u64);
                    assert_eq!(m.payload.value, vec![i]);
                }
                other => panic!("expected message, got {other:?}"),
            }
        }
    }
}
