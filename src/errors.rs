//! Crate-wide error type.
//!
//! Shaped after `siem_consumer::errors::ConsumerError`: one `thiserror` enum
//! wrapping the handful of lower-level error types the pipeline touches,
//! plus the fatal/transient split from spec.md §7 expressed as a predicate
//! rather than a parallel type hierarchy, since call sites just need to
//! decide whether to retry or abort.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("column store error: {0}")]
    ColumnStore(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("utf-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("invalid message version: {0}")]
    InvalidMessageVersion(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("shutdown requested")]
    ShutdownRequested,
}

impl Error {
    /// Per spec.md §7: transient broker errors and decode errors are
    /// absorbed locally; invariant violations and exhausted retries are
    /// fatal and must propagate to the top-level run loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::InvariantViolation(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
