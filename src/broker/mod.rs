//! C1: uniform broker abstraction (spec.md §4.1) plus C2's commit codec
//! (spec.md §4.3, §6).

pub mod commit;
pub mod consumer;
pub mod fake;
pub mod kafka;
pub mod producer;
pub mod types;

pub use commit::{Commit, CommitCodec, CommitLogConsumer};
pub use consumer::{AssignmentState, Consumer, ConsumerError, EndOfPartition, PollOutcome, RebalanceEvent};
pub use fake::{FakeBroker, FakeConsumer, FakeProducer};
pub use kafka::{KafkaConsumer, KafkaProducer};
pub use producer::{Destination, ProduceFuture, Producer};
pub use types::{AutoOffsetReset, Codec, KafkaPayload, Message, Partition, PartitionId, PassthroughCodec, Topic};
