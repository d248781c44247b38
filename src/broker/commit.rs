//! Commit codec and commit-log producing consumer: spec.md §3, §4.3, §6.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::consumer::{Consumer, ConsumerError, PollOutcome, RebalanceEvent};
use super::producer::{Destination, Producer};
use super::types::{KafkaPayload, Partition, Topic};

/// `(group, partition, offset)`, bit-exact encoded per spec.md §6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub group: String,
    pub partition: Partition,
    pub offset: u64,
}

impl Commit {
    pub fn new(group: impl Into<String>, partition: Partition, offset: u64) -> Self {
        Commit {
            group: group.into(),
            partition,
            offset,
        }
    }
}

/// Bit-exact `Commit` <-> `KafkaPayload` encoding.
///
/// Key: UTF-8 `"<topic>:<partition_index>:<group>"`.
/// Value: UTF-8 decimal offset, no whitespace, no newline.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommitCodec;

impl CommitCodec {
    pub fn encode(&self, commit: &Commit) -> KafkaPayload {
        let key = format!(
            "{}:{}:{}",
            commit.partition.topic, commit.partition.index, commit.group
        );
        let value = commit.offset.to_string();
        KafkaPayload::new(Some(key.into_bytes()), value.into_bytes())
    }

    /// A record missing a key is ignored; a value that doesn't parse as a
    /// non-negative integer is ignored. Both cases return `None` rather
    /// than an error — spec.md §6 treats malformed commit records as
    /// droppable, not fatal.
    pub fn decode(&self, payload: &KafkaPayload) -> Option<Commit> {
        let key = payload.key.as_ref()?;
        let key = std::str::from_utf8(key).ok()?;
        let mut parts = key.splitn(3, ':');
        let topic = parts.next()?;
        let index: u16 = parts.next()?.parse().ok()?;
        let group = parts.next()?;
        if group.is_empty() {
            return None;
        }

        let value = std::str::from_utf8(&payload.value).ok()?;
        let offset: u64 = value.parse().ok()?;

        Some(Commit::new(
            group.to_string(),
            Partition::new(Topic::new(topic), index),
            offset,
        ))
    }
}

/// Wraps a primary consumer's `commit_offsets()` with a publish of one
/// `Commit` record per `(group, partition)` to the commit-log topic, per
/// spec.md §4.3: "after a primary consumer successfully commits offsets for
/// group G, it publishes one record per (G, partition) to the commit log".
pub struct CommitLogConsumer<P> {
    inner: Box<dyn Consumer<P>>,
    group: String,
    commit_log_topic: Topic,
    commit_log_producer: Arc<dyn Producer<KafkaPayload>>,
    codec: CommitCodec,
}

impl<P> CommitLogConsumer<P> {
    pub fn new(
        inner: Box<dyn Consumer<P>>,
        group: impl Into<String>,
        commit_log_topic: Topic,
        commit_log_producer: Arc<dyn Producer<KafkaPayload>>,
    ) -> Self {
        CommitLogConsumer {
            inner,
            group: group.into(),
            commit_log_topic,
            commit_log_producer,
            codec: CommitCodec,
        }
    }
}

impl<P: Send> Consumer<P> for CommitLogConsumer<P> {
    fn subscribe(&mut self, topics: &[Topic]) -> Result<(), ConsumerError> {
        self.inner.subscribe(topics)
    }

    fn unsubscribe(&mut self) -> Result<(), ConsumerError> {
        self.inner.unsubscribe()
    }

    fn poll(&mut self, timeout: Duration) -> Result<PollOutcome<P>, ConsumerError> {
        self.inner.poll(timeout)
    }

    fn drain_rebalance_events(&mut self) -> Vec<RebalanceEvent> {
        self.inner.drain_rebalance_events()
    }

    fn pause(&mut self, partitions: &[Partition]) -> Result<(), ConsumerError> {
        self.inner.pause(partitions)
    }

    fn resume(&mut self, partitions: &[Partition]) -> Result<(), ConsumerError> {
        self.inner.resume(partitions)
    }

    fn paused(&self) -> std::collections::HashSet<Partition> {
        self.inner.paused()
    }

    fn tell(&self) -> HashMap<Partition, u64> {
        self.inner.tell()
    }

    fn seek(&mut self, offsets: HashMap<Partition, u64>) -> Result<(), ConsumerError> {
        self.inner.seek(offsets)
    }

    fn stage_offsets(&mut self, offsets: HashMap<Partition, u64>) -> Result<(), ConsumerError> {
        self.inner.stage_offsets(offsets)
    }

    fn commit_offsets(&mut self) -> Result<HashMap<Partition, u64>, ConsumerError> {
        let committed = self.inner.commit_offsets()?;
        for (partition, offset) in &committed {
            let commit = Commit::new(self.group.clone(), partition.clone(), *offset);
            let payload = self.codec.encode(&commit);
            // Fire-and-forget: the commit log is a best-effort barrier, not
            // part of the correctness-load-bearing offset commit itself.
            let future = self
                .commit_log_producer
                .produce(Destination::Topic(self.commit_log_topic.clone()), payload);
            tokio::spawn(async move {
                if let Err(e) = future.await {
                    tracing::warn!(error = %e, "failed to publish commit log record");
                }
            });
        }
        Ok(committed)
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_codec_round_trips() {
        let codec = CommitCodec;
        let commit = Commit::new("group", Partition::new(Topic::new("t"), 0), 42);
        let encoded = codec.encode(&commit);
        assert_eq!(encoded.key.as_deref(), Some(b"t:0:group".as_slice()));
        assert_eq!(encoded.value, b"42".to_vec());
        assert_eq!(codec.decode(&encoded), Some(commit));
    }

    #[test]
    fn commit_codec_round_trips_property_style() {
        let codec = CommitCodec;
        for (group, topic, index, offset) in [
            ("a", "topic-a", 0u16, 0u64),
            ("group-with-dashes", "topic", 7, 123456789),
            ("g", "topic_with_underscores", 3, 1),
        ] {
            let commit = Commit::new(group, Partition::new(Topic::new(topic), index), offset);
            let encoded = codec.encode(&commit);
            assert_eq!(codec.decode(&encoded), Some(commit));
        }
    }

    #[test]
    fn missing_key_is_ignored() {
        let codec = CommitCodec;
        let payload = KafkaPayload::new(None, b"42".to_vec());
        assert_eq!(codec.decode(&payload), None);
    }

    #[test]
    fn non_numeric_value_is_ignored() {
        let codec = CommitCodec;
        let payload = KafkaPayload::new(Some(b"t:0:group".to_vec()), b"not-a-number".to_vec());
        assert_eq!(codec.decode(&payload), None);
    }

    #[test]
    fn negative_looking_value_is_ignored() {
        let codec = CommitCodec;
        let payload = KafkaPayload::new(Some(b"t:0:group".to_vec()), b"-1".to_vec());
        assert_eq!(codec.decode(&payload), None);
    }
}
