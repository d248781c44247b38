//! C3: synchronized consumer, spec.md §4.3 — a primary consumer gated
//! against the downstream progress recorded on a commit-log topic, so a
//! slow snapshot load can never let the primary outrun what has actually
//! landed in the column store.
//!
//! There is no single pack file that implements this exact coordination;
//! it is built directly on the `Consumer<T>` pause/resume primitives
//! following the same single-threaded poll-loop shape `siem_consumer`
//! uses for its own `loop { ... }` ingest driver.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::broker::{Commit, CommitCodec, Consumer, ConsumerError, KafkaPayload, Partition, PollOutcome, RebalanceEvent, Topic};

/// Tracks the furthest offset each partition is known to have reached on
/// the remote (downstream) side, as reported by commit-log records.
#[derive(Default)]
struct RemoteOffsets {
    by_partition: HashMap<Partition, u64>,
}

impl RemoteOffsets {
    fn observe(&mut self, commit: &Commit) {
        self.by_partition
            .entry(commit.partition.clone())
            .and_modify(|o| *o = (*o).max(commit.offset))
            .or_insert(commit.offset);
    }

    fn for_partition(&self, partition: &Partition) -> Option<u64> {
        self.by_partition.get(partition).copied()
    }
}

/// Wraps a primary consumer and a commit-log consumer for the same group;
/// pauses a partition on the primary whenever its local read position has
/// caught up to (or passed) what the remote side has committed, and resumes
/// it once the remote side moves further ahead. There is no tolerance
/// window: the gate is `local_offset >= remote_offset`, matching spec.md
/// §4.3 exactly — a consumer may never deliver an offset the required group
/// has not yet confirmed via the commit log.
pub struct SynchronizedConsumer<T> {
    primary: Box<dyn Consumer<T>>,
    commit_log: Box<dyn Consumer<KafkaPayload>>,
    commit_log_topic: Topic,
    codec: CommitCodec,
    remote_offsets: RemoteOffsets,
    locally_paused: HashSet<Partition>,
}

impl<T: Send> SynchronizedConsumer<T> {
    pub fn new(
        primary: Box<dyn Consumer<T>>,
        commit_log: Box<dyn Consumer<KafkaPayload>>,
        commit_log_topic: Topic,
    ) -> Self {
        SynchronizedConsumer {
            primary,
            commit_log,
            commit_log_topic,
            codec: CommitCodec,
            remote_offsets: RemoteOffsets::default(),
            locally_paused: HashSet::new(),
        }
    }

    pub fn subscribe(&mut self, topics: &[Topic]) -> Result<(), ConsumerError> {
        self.commit_log.subscribe(&[self.commit_log_topic.clone()])?;
        self.primary.subscribe(topics)
    }

    /// Drains every available commit-log record without blocking the
    /// primary, updating `remote_offsets`, then reconciles pause/resume
    /// state against the primary's current read positions.
    fn catch_up_commit_log(&mut self) -> Result<(), ConsumerError> {
        loop {
            match self.commit_log.poll(Duration::from_millis(0))? {
                PollOutcome::Message(message) => {
                    if let Some(commit) = self.codec.decode(&message.payload) {
                        self.remote_offsets.observe(&commit);
                    }
                }
                PollOutcome::EndOfPartition(_) | PollOutcome::Timeout => break,
            }
        }
        self.reconcile_pauses()
    }

    fn reconcile_pauses(&mut self) -> Result<(), ConsumerError> {
        let positions = self.primary.tell();
        let mut to_pause = Vec::new();
        let mut to_resume = Vec::new();

        for (partition, local_offset) in &positions {
            let is_too_far_ahead = match self.remote_offsets.for_partition(partition) {
                // `local_offset` is the next offset this consumer would
                // read; once it reaches what the remote side has confirmed
                // there is no more room to deliver without racing ahead of
                // the required group, so the gate is strict `>=` with no
                // tolerance window.
                Some(remote_offset) => *local_offset >= remote_offset,
                // No remote progress observed yet for a freshly-assigned
                // partition: hold it paused until the commit log reports
                // at least one commit, matching the "new assignment starts
                // paused" rule in spec.md §4.3.
                None => true,
            };

            if is_too_far_ahead && !self.locally_paused.contains(partition) {
                to_pause.push(partition.clone());
            } else if !is_too_far_ahead && self.locally_paused.contains(partition) {
                to_resume.push(partition.clone());
            }
        }

        if !to_pause.is_empty() {
            self.primary.pause(&to_pause)?;
            self.locally_paused.extend(to_pause);
        }
        if !to_resume.is_empty() {
            self.primary.resume(&to_resume)?;
            for p in &to_resume {
                self.locally_paused.remove(p);
            }
        }
        Ok(())
    }

    pub fn poll(&mut self, timeout: Duration) -> Result<PollOutcome<T>, ConsumerError> {
        self.catch_up_commit_log()?;
        self.primary.poll(timeout)
    }

    pub fn drain_rebalance_events(&mut self) -> Vec<RebalanceEvent> {
        let mut events = self.primary.drain_rebalance_events();
        // A fresh assignment must start paused until the commit log has
        // something to say about it; drop any stale state for the newly
        // revoked side so it doesn't linger as "paused" forever.
        for event in &events {
            match event {
                RebalanceEvent::Assigned(partitions) => {
                    self.locally_paused.extend(partitions.keys().cloned());
                }
                RebalanceEvent::Revoked(partitions) => {
                    for p in partitions {
                        self.locally_paused.remove(p);
                    }
                }
            }
        }
        events.append(&mut self.commit_log.drain_rebalance_events());
        events
    }

    pub fn tell(&self) -> HashMap<Partition, u64> {
        self.primary.tell()
    }

    pub fn stage_offsets(&mut self, offsets: HashMap<Partition, u64>) -> Result<(), ConsumerError> {
        self.primary.stage_offsets(offsets)
    }

    pub fn commit_offsets(&mut self) -> Result<HashMap<Partition, u64>, ConsumerError> {
        self.primary.commit_offsets()
    }

    pub fn close(&mut self) {
        self.primary.close();
        self.commit_log.close();
    }
}

/// `SynchronizedConsumer` drops in wherever a plain `Consumer<T>` is
/// expected (e.g. wrapped by a `TickConsumer`); `pause`/`resume` are
/// exposed for API symmetry but the gate's own `reconcile_pauses` is the
/// only caller that should normally use them.
impl<T: Send> Consumer<T> for SynchronizedConsumer<T> {
    fn subscribe(&mut self, topics: &[Topic]) -> std::result::Result<(), ConsumerError> {
        SynchronizedConsumer::subscribe(self, topics)
    }

    fn unsubscribe(&mut self) -> std::result::Result<(), ConsumerError> {
        self.primary.unsubscribe()
    }

    fn poll(&mut self, timeout: Duration) -> std::result::Result<PollOutcome<T>, ConsumerError> {
        SynchronizedConsumer::poll(self, timeout)
    }

    fn drain_rebalance_events(&mut self) -> Vec<RebalanceEvent> {
        SynchronizedConsumer::drain_rebalance_events(self)
    }

    fn pause(&mut self, partitions: &[Partition]) -> std::result::Result<(), ConsumerError> {
        self.primary.pause(partitions)
    }

    fn resume(&mut self, partitions: &[Partition]) -> std::result::Result<(), ConsumerError> {
        self.primary.resume(partitions)
    }

    fn paused(&self) -> HashSet<Partition> {
        self.primary.paused()
    }

    fn tell(&self) -> HashMap<Partition, u64> {
        SynchronizedConsumer::tell(self)
    }

    fn seek(&mut self, offsets: HashMap<Partition, u64>) -> std::result::Result<(), ConsumerError> {
        self.primary.seek(offsets)
    }

    fn stage_offsets(&mut self, offsets: HashMap<Partition, u64>) -> std::result::Result<(), ConsumerError> {
        SynchronizedConsumer::stage_offsets(self, offsets)
    }

    fn commit_offsets(&mut self) -> std::result::Result<HashMap<Partition, u64>, ConsumerError> {
        SynchronizedConsumer::commit_offsets(self)
    }

    fn close(&mut self) {
        SynchronizedConsumer::close(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Destination, FakeBroker, FakeConsumer, FakeProducer, PassthroughCodec, Producer};
    use std::sync::Arc;

    fn codec() -> Arc<dyn crate::broker::Codec<KafkaPayload, KafkaPayload> + Send + Sync> {
        Arc::new(PassthroughCodec)
    }

    #[tokio::test]
    async fn new_assignment_stays_paused_until_a_commit_is_observed() {
        let broker = FakeBroker::new();
        let primary_topic = Topic::new("events");
        let commit_topic = Topic::new("events-commit-log");
        broker.create_topic(&primary_topic, 1);
        broker.create_topic(&commit_topic, 1);

        let primary_producer = FakeProducer::new(broker.clone(), codec());
        for i in 0..2u8 {
            primary_producer
                .produce(Destination::Topic(primary_topic.clone()), KafkaPayload::new(None, vec![i]))
                .await
                .unwrap();
        }

        let primary: FakeConsumer<KafkaPayload> = FakeConsumer::new(broker.clone(), codec(), false);
        let commit_log: FakeConsumer<KafkaPayload> = FakeConsumer::new(broker.clone(), codec(), false);

        let mut synced = SynchronizedConsumer::new(Box::new(primary), Box::new(commit_log), commit_topic.clone());
        synced.subscribe(&[primary_topic.clone()]).unwrap();
        synced.drain_rebalance_events();

        synced.reconcile_pauses().unwrap();
        let partition = Partition::new(primary_topic.clone(), 0);
        assert!(synced.locally_paused.contains(&partition));

        let commit_producer = FakeProducer::new(broker.clone(), codec());
        let commit_payload = CommitCodec.encode(&Commit::new("group", partition.clone(), 5));
        commit_producer
            .produce(Destination::Topic(commit_topic.clone()), commit_payload)
            .await
            .unwrap();

        synced.catch_up_commit_log().unwrap();
        assert!(!synced.locally_paused.contains(&partition));
    }
}
