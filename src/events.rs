/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events a process emits for event handling and logging.
//!
//! An event for a given action indicates that the action has been completed. For example, a
//! [`CommitEvent`] is only emitted after the COMMIT decision has been written to the durable log and the
//! payload has been applied.

use std::{sync::mpsc::Sender, time::SystemTime};

use crate::{
    three_phase_commit::{
        messages::{ProtocolMessage, Vote},
        types::{Role, State},
    },
    types::data_types::{Payload, ProcessID, TransactionID},
};

pub enum Event {
    // Events that change persistent state.
    BeginTransaction(BeginTransactionEvent),
    Vote(VoteEvent),
    Precommit(PrecommitEvent),
    Commit(CommitEvent),
    Abort(AbortEvent),
    RecoverTransaction(RecoverTransactionEvent),
    // Events that involve receiving a protocol message.
    ReceiveMessage(ReceiveMessageEvent),
    // Termination protocol events.
    StartElection(StartElectionEvent),
    BecomeCoordinator(BecomeCoordinatorEvent),
    // Failure monitor events.
    ProcessDead(ProcessDeadEvent),
    ProcessLive(ProcessLiveEvent),
}

impl Event {
    pub(crate) fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            // The event bus outlives every publisher, except during shutdown, when events may be dropped.
            let _ = event_publisher.send(self);
        }
    }
}

/// This process began a transaction as its coordinator and sent out its `VoteRequest`s.
pub struct BeginTransactionEvent {
    pub timestamp: SystemTime,
    pub transaction: TransactionID,
    pub payload: Payload,
}

/// This process logged and sent its vote on a transaction.
pub struct VoteEvent {
    pub timestamp: SystemTime,
    pub transaction: TransactionID,
    pub coordinator: ProcessID,
    pub vote: Vote,
}

/// This process logged a `Precommit` and became committable.
pub struct PrecommitEvent {
    pub timestamp: SystemTime,
    pub transaction: TransactionID,
    pub role: Role,
}

pub struct CommitEvent {
    pub timestamp: SystemTime,
    pub transaction: TransactionID,
    pub payload: Payload,
}

pub struct AbortEvent {
    pub timestamp: SystemTime,
    pub transaction: TransactionID,
}

/// A transaction was rebuilt from the durable log on startup.
pub struct RecoverTransactionEvent {
    pub timestamp: SystemTime,
    pub transaction: TransactionID,
    pub role: Role,
    pub state: State,
}

pub struct ReceiveMessageEvent {
    pub timestamp: SystemTime,
    pub message: ProtocolMessage,
}

/// This process's believed coordinator timed out, and it sent `YouAreElected` to `candidate`.
pub struct StartElectionEvent {
    pub timestamp: SystemTime,
    pub transaction: TransactionID,
    pub failed_coordinator: ProcessID,
    pub candidate: ProcessID,
}

/// This process was elected coordinator and started the termination protocol.
pub struct BecomeCoordinatorEvent {
    pub timestamp: SystemTime,
    pub transaction: TransactionID,
    pub termination_participants: Vec<ProcessID>,
}

pub struct ProcessDeadEvent {
    pub timestamp: SystemTime,
    pub process: ProcessID,
}

pub struct ProcessLiveEvent {
    pub timestamp: SystemTime,
    pub process: ProcessID,
}
