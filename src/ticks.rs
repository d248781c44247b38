//! C6: tick consumer, spec.md §4.5 — converts per-partition offset
//! progress on the primary topic into non-overlapping wall-clock
//! intervals, without decoding payloads.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use crate::broker::{Consumer, ConsumerError, Partition, PollOutcome};

/// Half-open interval `[lower, upper)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval<T> {
    pub lower: T,
    pub upper: T,
}

impl<T> Interval<T> {
    pub fn new(lower: T, upper: T) -> Self {
        Interval { lower, upper }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tick {
    pub partition: Partition,
    pub offsets: Interval<u64>,
    pub timestamps: Interval<SystemTime>,
}

struct LastSeen {
    offset: u64,
    timestamp: SystemTime,
}

/// Wraps an inner consumer of undecoded payloads and converts its message
/// stream into ticks. Does not decode `P`; the inner consumer's codec can
/// be a `PassthroughCodec` since the payload bytes are never inspected.
pub struct TickConsumer<P> {
    inner: Box<dyn Consumer<P>>,
    last_seen: HashMap<Partition, LastSeen>,
}

impl<P: Send> TickConsumer<P> {
    pub fn new(inner: Box<dyn Consumer<P>>) -> Self {
        TickConsumer {
            inner,
            last_seen: HashMap::new(),
        }
    }

    /// Polls the inner consumer once; returns `Some(tick)` only once a
    /// partition has produced a second message to diff against its first.
    pub fn poll(&mut self, timeout: Duration) -> Result<Option<Tick>, ConsumerError> {
        match self.inner.poll(timeout)? {
            PollOutcome::Message(message) => {
                let partition = message.partition.clone();
                let offset = message.offset;
                let timestamp = message.timestamp;

                let tick = match self.last_seen.get(&partition) {
                    Some(last) => Some(Tick {
                        partition: partition.clone(),
                        offsets: Interval::new(last.offset, offset),
                        timestamps: Interval::new(last.timestamp, timestamp),
                    }),
                    None => None,
                };

                self.last_seen.insert(partition, LastSeen { offset, timestamp });
                Ok(tick)
            }
            PollOutcome::EndOfPartition(_) | PollOutcome::Timeout => Ok(None),
        }
    }

    pub fn tell(&self) -> HashMap<Partition, u64> {
        self.inner.tell()
    }

    pub fn stage_offsets(&mut self, offsets: HashMap<Partition, u64>) -> Result<(), ConsumerError> {
        self.inner.stage_offsets(offsets)
    }

    pub fn commit_offsets(&mut self) -> Result<HashMap<Partition, u64>, ConsumerError> {
        self.inner.commit_offsets()
    }

    pub fn drain_rebalance_events(&mut self) -> Vec<crate::broker::RebalanceEvent> {
        self.inner.drain_rebalance_events()
    }

    pub fn close(&mut self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Destination, FakeBroker, FakeConsumer, FakeProducer, KafkaPayload, PassthroughCodec, Producer, Topic};
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn emits_contiguous_ticks_between_consecutive_messages() {
        let broker = FakeBroker::new();
        let topic = Topic::new("events");
        broker.create_topic(&topic, 1);
        let codec: Arc<dyn crate::broker::Codec<KafkaPayload, KafkaPayload> + Send + Sync> =
            Arc::new(PassthroughCodec);
        let producer = FakeProducer::new(broker.clone(), codec.clone());

        for i in 0..3u8 {
            producer
                .produce(Destination::Topic(topic.clone()), KafkaPayload::new(None, vec![i]))
                .await
                .unwrap();
            // Force distinct wall-clock timestamps between produced
            // messages so the tick intervals are non-degenerate.
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }

        let mut consumer: FakeConsumer<KafkaPayload> = FakeConsumer::new(broker, codec, false);
        consumer.subscribe(&[topic]).unwrap();
        let mut ticks = TickConsumer::new(Box::new(consumer));

        let first = ticks.poll(StdDuration::from_millis(10)).unwrap();
        assert!(first.is_none());

        let second = ticks.poll(StdDuration::from_millis(10)).unwrap().unwrap();
        assert_eq!(second.offsets, Interval::new(0, 1));
        assert!(second.timestamps.upper > second.timestamps.lower);

        let third = ticks.poll(StdDuration::from_millis(10)).unwrap().unwrap();
        assert_eq!(third.offsets, Interval::new(1, 2));
    }
}
