//! Broker producer contract: spec.md §4.1.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use super::consumer::ConsumerError;
use super::types::{Message, Partition, Topic};

/// Either a topic (the broker's partitioner picks the partition) or a
/// specific partition.
#[derive(Debug, Clone)]
pub enum Destination {
    Topic(Topic),
    Partition(Partition),
}

pub type ProduceFuture<P> =
    Pin<Box<dyn Future<Output = Result<Message<P>, ConsumerError>> + Send>>;

/// `produce` returns a future completing when the broker acknowledges
/// durability. Implementations must provide a `close` that flushes pending
/// futures within a bounded timeout (spec.md §5 "Cancellation &
/// timeouts").
pub trait Producer<P>: Send + Sync {
    fn produce(&self, destination: Destination, payload: P) -> ProduceFuture<P>;

    /// Flushes pending futures, waiting up to `timeout`. Records still
    /// in flight when the timeout elapses are logged and dropped (spec.md
    /// §5); returns the number dropped.
    fn close(&self, timeout: Duration) -> usize;
}
