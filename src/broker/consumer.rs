//! Broker consumer contract: spec.md §4.1.

use std::collections::{HashMap, HashSet};

use super::types::{Message, Partition};

/// Distinguishes transient (poll retriable) errors from fatal ones (the
/// consumer is irrecoverably broken and must be closed), per spec.md §4.1
/// "Failure model".
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("transient broker error: {0}")]
    Transient(String),

    #[error("fatal broker error: {0}")]
    Fatal(String),
}

impl ConsumerError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConsumerError::Fatal(_))
    }
}

/// End-of-partition is a distinct signal, not an error, only surfaced when
/// `enable_end_of_partition` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndOfPartition {
    pub partition: Partition,
    pub offset: u64,
}

/// Result of a single `poll` call: a message, an end-of-partition signal
/// (only when enabled), or nothing within the timeout.
#[derive(Debug)]
pub enum PollOutcome<P> {
    Message(Message<P>),
    EndOfPartition(EndOfPartition),
    Timeout,
}

/// The assignment lifecycle described in spec.md §9 "Callback-heavy
/// rebalance model": modeled as an explicit state machine driven by events
/// surfaced from `poll`, rather than letting the broker client's rebalance
/// callbacks run on a thread other than the poll thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentState {
    Idle,
    Assigning,
    Assigned,
    Revoking,
    Closed,
}

impl AssignmentState {
    pub fn on_assign_begin(self) -> Self {
        match self {
            AssignmentState::Idle | AssignmentState::Assigned => AssignmentState::Assigning,
            other => other,
        }
    }

    pub fn on_assign_complete(self) -> Self {
        match self {
            AssignmentState::Assigning => AssignmentState::Assigned,
            other => other,
        }
    }

    pub fn on_revoke_begin(self) -> Self {
        match self {
            AssignmentState::Assigned => AssignmentState::Revoking,
            other => other,
        }
    }

    pub fn on_revoke_complete(self) -> Self {
        match self {
            AssignmentState::Revoking => AssignmentState::Idle,
            other => other,
        }
    }

    pub fn on_close(self) -> Self {
        AssignmentState::Closed
    }
}

/// A rebalance event surfaced from `poll`, consumed by the harness to run
/// the assignment FSM above and to trigger the pre-emptive flush in
/// spec.md §4.2 step 5.
#[derive(Debug, Clone)]
pub enum RebalanceEvent {
    Assigned(HashMap<Partition, u64>),
    Revoked(Vec<Partition>),
}

/// Uniform API over an underlying log broker: spec.md §4.1.
pub trait Consumer<P>: Send {
    /// Registers interest in `topics`. Callbacks fire on subsequent `poll`
    /// calls, never from a broker-internal thread.
    fn subscribe(&mut self, topics: &[super::types::Topic]) -> Result<(), ConsumerError>;

    fn unsubscribe(&mut self) -> Result<(), ConsumerError>;

    /// Returns the next message, an end-of-partition signal, or nothing
    /// within `timeout`. Rebalance events observed during this call are
    /// returned via `drain_rebalance_events`.
    fn poll(&mut self, timeout: std::time::Duration) -> Result<PollOutcome<P>, ConsumerError>;

    /// Rebalance events accumulated by the most recent `poll` call.
    fn drain_rebalance_events(&mut self) -> Vec<RebalanceEvent>;

    fn pause(&mut self, partitions: &[Partition]) -> Result<(), ConsumerError>;
    fn resume(&mut self, partitions: &[Partition]) -> Result<(), ConsumerError>;
    fn paused(&self) -> HashSet<Partition>;

    /// Next-to-read offset per assigned partition.
    fn tell(&self) -> HashMap<Partition, u64>;

    fn seek(&mut self, offsets: HashMap<Partition, u64>) -> Result<(), ConsumerError>;

    fn stage_offsets(&mut self, offsets: HashMap<Partition, u64>) -> Result<(), ConsumerError>;

    fn commit_offsets(&mut self) -> Result<HashMap<Partition, u64>, ConsumerError>;

    /// Idempotent final resource release.
    fn close(&mut self);
}
