//! `rdkafka`-backed implementation of the broker abstraction.
//!
//! Grounded in `siem_consumer/src/main.rs::create_consumer` for basic
//! `ClientConfig` setup and in
//! `siem_unified_pipeline/src/v2/workers/kafka_consumer.rs`'s
//! `ConsumerContext` for turning rdkafka's rebalance callbacks — which fire
//! from inside `poll` but on rdkafka's internal machinery, not a thread we
//! control — into the `RebalanceEvent`s the assignment FSM in
//! `broker::consumer` expects, queued up and drained by the caller on the
//! same poll thread (spec.md §9 "do not rely on runtime callbacks escaping
//! the poll thread").

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{
    BaseConsumer, Consumer as RdConsumer, ConsumerContext as RdConsumerContext, Rebalance,
};
use rdkafka::error::KafkaError;
use rdkafka::message::Message as RdMessage;
use rdkafka::producer::{
    BaseProducer, BaseRecord, DeliveryResult, Producer as RdProducer, ProducerContext, ThreadedProducer,
};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};

use super::consumer::{Consumer, ConsumerError, EndOfPartition, PollOutcome, RebalanceEvent};
use super::producer::{Destination, ProduceFuture, Producer};
use super::types::{AutoOffsetReset, Codec, KafkaPayload, Message, Partition, Topic};

fn to_consumer_error(e: KafkaError) -> ConsumerError {
    use rdkafka::error::KafkaError::*;
    match e {
        // Message/partition level transient conditions are retriable;
        // everything else is treated as fatal, matching spec.md §4.1's
        // "consumer unusable; must be closed" framing for anything the
        // caller cannot reasonably recover from by polling again.
        MessageConsumption(_) | MessageProduction(_) => ConsumerError::Transient(e.to_string()),
        other => ConsumerError::Fatal(other.to_string()),
    }
}

/// Rebalance events, captured from rdkafka's callback and drained by the
/// next `poll` on the same thread.
#[derive(Default)]
struct RebalanceQueue(Mutex<Vec<RebalanceEvent>>);

struct RebalanceContext {
    queue: Arc<RebalanceQueue>,
}

impl ClientContext for RebalanceContext {}

impl RdConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        if let Rebalance::Revoke(tpl) = rebalance {
            let partitions = tpl_to_partitions(tpl);
            self.queue
                .0
                .lock()
                .unwrap()
                .push(RebalanceEvent::Revoked(partitions));
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        if let Rebalance::Assign(tpl) = rebalance {
            let mapping = tpl
                .elements()
                .into_iter()
                .map(|el| {
                    let offset = match el.offset() {
                        Offset::Offset(o) => o.max(0) as u64,
                        _ => 0,
                    };
                    (Partition::new(Topic::new(el.topic()), el.partition() as u16), offset)
                })
                .collect();
            self.queue
                .0
                .lock()
                .unwrap()
                .push(RebalanceEvent::Assigned(mapping));
        }
    }
}

fn tpl_to_partitions(tpl: &TopicPartitionList) -> Vec<Partition> {
    tpl.elements()
        .into_iter()
        .map(|el| Partition::new(Topic::new(el.topic()), el.partition() as u16))
        .collect()
}

type ConsumerType = BaseConsumer<RebalanceContext>;

/// `KafkaConsumer<P>`: one rdkafka `BaseConsumer` plus a `Codec` decoding
/// each record's `KafkaPayload` into `P`.
pub struct KafkaConsumer<P> {
    consumer: ConsumerType,
    codec: Arc<dyn Codec<KafkaPayload, P> + Send + Sync>,
    rebalance_queue: Arc<RebalanceQueue>,
    enable_end_of_partition: bool,
    paused: HashSet<Partition>,
}

impl<P> KafkaConsumer<P> {
    pub fn new(
        mut config: ClientConfig,
        auto_offset_reset: AutoOffsetReset,
        enable_end_of_partition: bool,
        codec: Arc<dyn Codec<KafkaPayload, P> + Send + Sync>,
    ) -> crate::Result<Self> {
        let queue = Arc::new(RebalanceQueue::default());
        config
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", auto_offset_reset.as_str())
            .set(
                "enable.partition.eof",
                if enable_end_of_partition { "true" } else { "false" },
            );

        let context = RebalanceContext {
            queue: queue.clone(),
        };
        let consumer: ConsumerType = config
            .create_with_context(context)
            .map_err(crate::Error::Kafka)?;

        Ok(KafkaConsumer {
            consumer,
            codec,
            rebalance_queue: queue,
            enable_end_of_partition,
            paused: HashSet::new(),
        })
    }
}

impl<P> Consumer<P> for KafkaConsumer<P> {
    fn subscribe(&mut self, topics: &[Topic]) -> Result<(), ConsumerError> {
        let names: Vec<&str> = topics.iter().map(|t| t.as_str()).collect();
        self.consumer.subscribe(&names).map_err(to_consumer_error)
    }

    fn unsubscribe(&mut self) -> Result<(), ConsumerError> {
        self.consumer.unsubscribe();
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<PollOutcome<P>, ConsumerError> {
        match self.consumer.poll(timeout) {
            None => Ok(PollOutcome::Timeout),
            Some(Err(KafkaError::PartitionEOF(partition_id))) if self.enable_end_of_partition => {
                // rdkafka only reports the partition id on this variant; the
                // topic is recovered from the current subscription, which is
                // always a single topic for every consumer this crate
                // creates.
                let assignment = self.consumer.assignment().map_err(to_consumer_error)?;
                let topic = assignment
                    .elements()
                    .first()
                    .map(|e| Topic::new(e.topic()))
                    .unwrap_or_else(|| Topic::new(""));
                let partition = Partition::new(topic, partition_id as u16);
                let offset = self
                    .consumer
                    .position()
                    .ok()
                    .and_then(|tpl| {
                        tpl.elements().into_iter().find_map(|el| {
                            if el.partition() == partition_id {
                                if let Offset::Offset(o) = el.offset() {
                                    return Some(o as u64);
                                }
                            }
                            None
                        })
                    })
                    .unwrap_or(0);
                Ok(PollOutcome::EndOfPartition(EndOfPartition {
                    partition,
                    offset,
                }))
            }
            Some(Err(e)) => Err(to_consumer_error(e)),
            Some(Ok(borrowed)) => {
                let partition = Partition::new(Topic::new(borrowed.topic()), borrowed.partition() as u16);
                let key = borrowed.key().map(|k| k.to_vec());
                let value = borrowed.payload().unwrap_or(&[]).to_vec();
                let timestamp = borrowed
                    .timestamp()
                    .to_millis()
                    .map(|ms| UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64))
                    .unwrap_or_else(SystemTime::now);
                let payload = self
                    .codec
                    .decode(KafkaPayload::new(key, value))
                    .map_err(|e| ConsumerError::Fatal(e.to_string()))?;
                Ok(PollOutcome::Message(Message::new(
                    partition,
                    borrowed.offset() as u64,
                    payload,
                    timestamp,
                )))
            }
        }
    }

    fn drain_rebalance_events(&mut self) -> Vec<RebalanceEvent> {
        std::mem::take(&mut self.rebalance_queue.0.lock().unwrap())
    }

    fn pause(&mut self, partitions: &[Partition]) -> Result<(), ConsumerError> {
        let mut tpl = TopicPartitionList::new();
        for p in partitions {
            tpl.add_partition(p.topic.as_str(), p.index as i32);
            self.paused.insert(p.clone());
        }
        self.consumer.pause(&tpl).map_err(to_consumer_error)
    }

    fn resume(&mut self, partitions: &[Partition]) -> Result<(), ConsumerError> {
        let mut tpl = TopicPartitionList::new();
        for p in partitions {
            tpl.add_partition(p.topic.as_str(), p.index as i32);
            self.paused.remove(p);
        }
        self.consumer.resume(&tpl).map_err(to_consumer_error)
    }

    fn paused(&self) -> HashSet<Partition> {
        self.paused.clone()
    }

    fn tell(&self) -> HashMap<Partition, u64> {
        self.consumer
            .position()
            .map(|tpl| {
                tpl.elements()
                    .into_iter()
                    .filter_map(|el| match el.offset() {
                        Offset::Offset(o) => Some((
                            Partition::new(Topic::new(el.topic()), el.partition() as u16),
                            o as u64,
                        )),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn seek(&mut self, offsets: HashMap<Partition, u64>) -> Result<(), ConsumerError> {
        for (partition, offset) in offsets {
            self.consumer
                .seek(
                    partition.topic.as_str(),
                    partition.index as i32,
                    Offset::Offset(offset as i64),
                    Duration::from_secs(5),
                )
                .map_err(to_consumer_error)?;
        }
        Ok(())
    }

    fn stage_offsets(&mut self, offsets: HashMap<Partition, u64>) -> Result<(), ConsumerError> {
        for (partition, offset) in offsets {
            self.consumer
                .store_offset(partition.topic.as_str(), partition.index as i32, offset as i64)
                .map_err(to_consumer_error)?;
        }
        Ok(())
    }

    fn commit_offsets(&mut self) -> Result<HashMap<Partition, u64>, ConsumerError> {
        self.consumer
            .commit_consumer_state(rdkafka::consumer::CommitMode::Sync)
            .map_err(to_consumer_error)?;
        let committed = self
            .consumer
            .committed(Duration::from_secs(10))
            .map_err(to_consumer_error)?;
        Ok(committed
            .elements()
            .into_iter()
            .filter_map(|el| match el.offset() {
                Offset::Offset(o) => Some((
                    Partition::new(Topic::new(el.topic()), el.partition() as u16),
                    o as u64,
                )),
                _ => None,
            })
            .collect())
    }

    fn close(&mut self) {
        self.consumer.unsubscribe();
    }
}

type DeliveryOutcome = Result<(u16, u64), KafkaError>;

/// Delivers the broker's final ack (or failure) for one produced record
/// back through a oneshot channel, so `produce`'s returned future
/// completes on durability per spec.md §4.1 rather than on enqueue.
struct DeliveryContext;

impl ClientContext for DeliveryContext {}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = Box<tokio::sync::oneshot::Sender<DeliveryOutcome>>;

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, delivery_opaque: Self::DeliveryOpaque) {
        let outcome = match delivery_result {
            Ok(msg) => Ok((msg.partition() as u16, msg.offset() as u64)),
            Err((e, _)) => Err(e.clone()),
        };
        let _ = delivery_opaque.send(outcome);
    }
}

/// `KafkaProducer<P>`: one rdkafka `ThreadedProducer` (its own I/O thread,
/// per spec.md §5's "the producer's internal I/O thread" parallelism note)
/// plus a `Codec` encoding `P` into a `KafkaPayload`.
pub struct KafkaProducer<P> {
    producer: ThreadedProducer<DeliveryContext>,
    codec: Arc<dyn Codec<KafkaPayload, P> + Send + Sync>,
}

impl<P> KafkaProducer<P> {
    pub fn new(
        config: ClientConfig,
        codec: Arc<dyn Codec<KafkaPayload, P> + Send + Sync>,
    ) -> crate::Result<Self> {
        let producer: ThreadedProducer<_> = config.create_with_context(DeliveryContext).map_err(crate::Error::Kafka)?;
        Ok(KafkaProducer { producer, codec })
    }
}

impl<P: Send + 'static> Producer<P> for KafkaProducer<P>
where
    P: Clone,
{
    fn produce(&self, destination: Destination, payload: P) -> ProduceFuture<P> {
        let encoded = self.codec.encode(payload.clone());
        let (topic, partition) = match destination {
            Destination::Topic(t) => (t, None),
            Destination::Partition(p) => (p.topic.clone(), Some(p.index as i32)),
        };

        let (tx, rx) = tokio::sync::oneshot::channel();

        let mut record = BaseRecord::to(topic.as_str())
            .payload(&encoded.value)
            .delivery_opaque(Box::new(tx));
        if let Some(key) = encoded.key.as_ref() {
            record = record.key(key);
        }
        if let Some(p) = partition {
            record = record.partition(p);
        }

        let send_result = self.producer.send(record);
        let fallback_partition = match destination_index(&topic, partition) {
            Some(idx) => Partition::new(topic.clone(), idx),
            None => Partition::new(topic, 0),
        };

        Box::pin(async move {
            // `send` only enqueues; an immediate `Err` here means the queue
            // itself rejected the record (e.g. full) and no delivery report
            // will ever arrive for it.
            if let Err((e, _)) = send_result {
                return Err(to_consumer_error(e));
            }

            match rx.await {
                Ok(Ok((index, offset))) => Ok(Message::new(
                    Partition::new(fallback_partition.topic, index),
                    offset,
                    payload,
                    SystemTime::now(),
                )),
                Ok(Err(e)) => Err(to_consumer_error(e)),
                // The producer was dropped/closed before the delivery
                // callback fired; treat as fatal since durability is
                // unknown.
                Err(_) => Err(ConsumerError::Fatal(
                    "producer closed before delivery report arrived".to_string(),
                )),
            }
        })
    }

    fn close(&self, timeout: Duration) -> usize {
        let remaining = self.producer.in_flight_count().max(0) as usize;
        self.producer.flush(timeout).ok();
        let still_in_flight = self.producer.in_flight_count().max(0) as usize;
        if still_in_flight > 0 {
            tracing::warn!(dropped = still_in_flight, "producer close timed out, dropping records");
        }
        remaining.saturating_sub(still_in_flight)
    }
}

fn destination_index(_topic: &Topic, partition: Option<i32>) -> Option<u16> {
    partition.map(|p| p as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_consumer_error_classifies_consumption_errors_as_transient() {
        let err = to_consumer_error(KafkaError::MessageConsumption(
            rdkafka::error::RDKafkaErrorCode::AllBrokersDown,
        ));
        assert!(!err.is_fatal());
    }
}
