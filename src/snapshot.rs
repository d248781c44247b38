//! Supplemental feature: the snapshot-coordinating consumer's state
//! machine, spec.md §9 design note, grounded in
//! `examples/original_source/snuba/cli/snapshot_consumer.py`'s
//! `ConsumerContext`/`StateType` pairing — a dataset consumer that can be
//! paused mid-stream while an externally produced snapshot loads, then
//! catch up on the control topic's coordinates before resuming the main
//! topic.
//!
//! This module implements only the state machine itself; wiring a control
//! topic consumer and an external snapshot loader is out of scope (no
//! [[bin]] target drives this type).

/// Control messages that drive state transitions, named after the
/// snapshot lifecycle events in the original stateful consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    SnapshotInit { snapshot_id: String },
    SnapshotReady { snapshot_id: String, transaction_data: Vec<u8> },
    SnapshotAbort { snapshot_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotConsumerState {
    Consuming,
    PausedForSnapshot,
    CatchingUp,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    /// The control message doesn't apply to the current state (e.g. a
    /// `SnapshotReady` while already `Consuming`).
    InvalidForState(SnapshotConsumerState),
    AlreadyClosed,
}

pub struct SnapshotConsumerFsm {
    state: SnapshotConsumerState,
    active_snapshot_id: Option<String>,
}

impl Default for SnapshotConsumerFsm {
    fn default() -> Self {
        SnapshotConsumerFsm {
            state: SnapshotConsumerState::Consuming,
            active_snapshot_id: None,
        }
    }
}

impl SnapshotConsumerFsm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SnapshotConsumerState {
        self.state
    }

    /// `Consuming -> PausedForSnapshot` on `SnapshotInit`. The main topic
    /// consumer must be paused by the caller as soon as this returns Ok.
    pub fn on_control_message(&mut self, message: ControlMessage) -> Result<SnapshotConsumerState, TransitionError> {
        if self.state == SnapshotConsumerState::Closed {
            return Err(TransitionError::AlreadyClosed);
        }

        match (self.state, &message) {
            (SnapshotConsumerState::Consuming, ControlMessage::SnapshotInit { snapshot_id }) => {
                self.active_snapshot_id = Some(snapshot_id.clone());
                self.state = SnapshotConsumerState::PausedForSnapshot;
                Ok(self.state)
            }
            (SnapshotConsumerState::PausedForSnapshot, ControlMessage::SnapshotReady { snapshot_id, .. })
                if self.active_snapshot_id.as_deref() == Some(snapshot_id.as_str()) =>
            {
                self.state = SnapshotConsumerState::CatchingUp;
                Ok(self.state)
            }
            (SnapshotConsumerState::PausedForSnapshot, ControlMessage::SnapshotAbort { snapshot_id })
            | (SnapshotConsumerState::CatchingUp, ControlMessage::SnapshotAbort { snapshot_id })
                if self.active_snapshot_id.as_deref() == Some(snapshot_id.as_str()) =>
            {
                self.active_snapshot_id = None;
                self.state = SnapshotConsumerState::Consuming;
                Ok(self.state)
            }
            (other, _) => Err(TransitionError::InvalidForState(other)),
        }
    }

    /// `CatchingUp -> Consuming` once the main topic consumer has
    /// replayed up to the snapshot's transaction boundary.
    pub fn on_caught_up(&mut self) -> Result<SnapshotConsumerState, TransitionError> {
        if self.state != SnapshotConsumerState::CatchingUp {
            return Err(TransitionError::InvalidForState(self.state));
        }
        self.active_snapshot_id = None;
        self.state = SnapshotConsumerState::Consuming;
        Ok(self.state)
    }

    pub fn close(&mut self) {
        self.state = SnapshotConsumerState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_snapshot_lifecycle_returns_to_consuming() {
        let mut fsm = SnapshotConsumerFsm::new();
        assert_eq!(fsm.state(), SnapshotConsumerState::Consuming);

        fsm.on_control_message(ControlMessage::SnapshotInit {
            snapshot_id: "snap-1".to_string(),
        })
        .unwrap();
        assert_eq!(fsm.state(), SnapshotConsumerState::PausedForSnapshot);

        fsm.on_control_message(ControlMessage::SnapshotReady {
            snapshot_id: "snap-1".to_string(),
            transaction_data: vec![],
        })
        .unwrap();
        assert_eq!(fsm.state(), SnapshotConsumerState::CatchingUp);

        fsm.on_caught_up().unwrap();
        assert_eq!(fsm.state(), SnapshotConsumerState::Consuming);
    }

    #[test]
    fn abort_returns_to_consuming_from_either_pending_state() {
        let mut fsm = SnapshotConsumerFsm::new();
        fsm.on_control_message(ControlMessage::SnapshotInit {
            snapshot_id: "snap-2".to_string(),
        })
        .unwrap();
        fsm.on_control_message(ControlMessage::SnapshotAbort {
            snapshot_id: "snap-2".to_string(),
        })
        .unwrap();
        assert_eq!(fsm.state(), SnapshotConsumerState::Consuming);
    }

    #[test]
    fn mismatched_snapshot_id_is_rejected() {
        let mut fsm = SnapshotConsumerFsm::new();
        fsm.on_control_message(ControlMessage::SnapshotInit {
            snapshot_id: "snap-3".to_string(),
        })
        .unwrap();
        let err = fsm
            .on_control_message(ControlMessage::SnapshotReady {
                snapshot_id: "wrong-id".to_string(),
                transaction_data: vec![],
            })
            .unwrap_err();
        assert_eq!(err, TransitionError::InvalidForState(SnapshotConsumerState::PausedForSnapshot));
    }

    #[test]
    fn closed_rejects_further_transitions() {
        let mut fsm = SnapshotConsumerFsm::new();
        fsm.close();
        let err = fsm
            .on_control_message(ControlMessage::SnapshotInit {
                snapshot_id: "snap-4".to_string(),
            })
            .unwrap_err();
        assert_eq!(err, TransitionError::AlreadyClosed);
    }
}
