//! Core broker data model: spec.md §3.
//!
//! Generic over a payload codec, matching spec.md §9's instruction to model
//! dynamic payload types as a two-type-parameter trait (`Codec<W, V>`) rather
//! than runtime reflection.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic(pub String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Topic(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `(Topic, index)` where index ranges over `[0, N)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition {
    pub topic: Topic,
    pub index: u16,
}

impl Partition {
    pub fn new(topic: Topic, index: u16) -> Self {
        Partition { topic, index }
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.topic, self.index)
    }
}

/// Newtype used by the subscription scheduler as its per-partition key,
/// matching `snuba.subscriptions.data.PartitionId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId(pub u16);

/// The raw wire record: `(key: bytes?, value: bytes)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaPayload {
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
}

impl KafkaPayload {
    pub fn new(key: Option<Vec<u8>>, value: Vec<u8>) -> Self {
        KafkaPayload { key, value }
    }
}

/// `(Partition, offset, payload, timestamp)`. `payload` is already
/// codec-decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<P> {
    pub partition: Partition,
    pub offset: u64,
    pub payload: P,
    pub timestamp: SystemTime,
}

impl<P> Message<P> {
    pub fn new(partition: Partition, offset: u64, payload: P, timestamp: SystemTime) -> Self {
        Message {
            partition,
            offset,
            payload,
            timestamp,
        }
    }

    /// Offset one past this message; the value that must be staged for
    /// commit so a restart resumes here.
    pub fn next_offset(&self) -> u64 {
        self.offset + 1
    }

    pub fn map<Q>(self, f: impl FnOnce(P) -> Q) -> Message<Q> {
        Message {
            partition: self.partition,
            offset: self.offset,
            payload: f(self.payload),
            timestamp: self.timestamp,
        }
    }
}

/// Two-type-parameter codec: wire representation `W` <-> decoded value `V`.
pub trait Codec<W, V>: Send + Sync {
    fn encode(&self, value: V) -> W;
    fn decode(&self, wire: W) -> crate::Result<V>;
}

/// Identity codec: used where the consumer only needs the raw wire payload
/// (e.g. the tick consumer, which never decodes message bodies).
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughCodec;

impl Codec<KafkaPayload, KafkaPayload> for PassthroughCodec {
    fn encode(&self, value: KafkaPayload) -> KafkaPayload {
        value
    }

    fn decode(&self, wire: KafkaPayload) -> crate::Result<KafkaPayload> {
        Ok(wire)
    }
}

/// Auto-offset-reset policy at subscription start, per spec.md §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoOffsetReset {
    Earliest,
    Latest,
    Error,
}

impl AutoOffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoOffsetReset::Earliest => "earliest",
            AutoOffsetReset::Latest => "latest",
            AutoOffsetReset::Error => "error",
        }
    }
}

impl std::str::FromStr for AutoOffsetReset {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "earliest" => Ok(AutoOffsetReset::Earliest),
            "latest" => Ok(AutoOffsetReset::Latest),
            "error" => Ok(AutoOffsetReset::Error),
            other => Err(crate::Error::Config(format!(
                "invalid auto_offset_reset: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_offset_is_offset_plus_one() {
        let msg = Message::new(
            Partition::new(Topic::new("t"), 0),
            41,
            KafkaPayload::new(None, vec![]),
            SystemTime::now(),
        );
        assert_eq!(msg.next_offset(), 42);
    }

    #[test]
    fn auto_offset_reset_parses() {
        assert_eq!(
            "earliest".parse::<AutoOffsetReset>().unwrap(),
            AutoOffsetReset::Earliest
        );
        assert!("bogus".parse::<AutoOffsetReset>().is_err());
    }
}
