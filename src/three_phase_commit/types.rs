/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types specific to the three-phase commit subprotocol.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, PoisonError},
};

use crate::types::data_types::{Payload, ProcessID, TransactionID};

use super::messages::Vote;

/// The role this process currently plays in a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Coordinator,
    Participant,
}

/// How far a transaction has progressed at this process.
///
/// States progress monotonically in the order `Aborted → Uncertain → Committable → Committed`, except that
/// any undecided state can move to `Aborted` on an ABORT decision.
///
/// `Aborted` is also the state of a transaction this process has not voted on. Whether `Aborted` is
/// final is told by the [`Decision`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Aborted,
    Uncertain,
    Committable,
    Committed,
}

/// The terminal outcome of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Commit,
    Abort,
}

/// A copy of the externally interesting parts of a transaction's record, taken at some point in time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionSnapshot {
    pub id: TransactionID,
    pub role: Role,
    pub state: State,
    pub decision: Option<Decision>,

    /// The process this process believes is the transaction's coordinator.
    pub coordinator: ProcessID,
    pub payload: Payload,

    /// Processes whose next message this process is waiting for.
    pub waiting_on: BTreeSet<ProcessID>,
    pub in_termination_protocol: bool,

    /// Set if appending to the durable log failed while processing this transaction. A fenced transaction
    /// makes no further progress.
    pub fenced: bool,
}

/// Scratch state of an elected coordinator while it collects answers to its `StateRequest`s.
#[derive(Clone, Debug, Default)]
pub(crate) struct Termination {
    /// Processes that were live when this process was elected, excluding this process.
    pub(crate) snapshot: BTreeSet<ProcessID>,
    pub(crate) committable: BTreeSet<ProcessID>,
    pub(crate) uncertain: BTreeSet<ProcessID>,
}

impl Termination {
    pub(crate) fn new(snapshot: BTreeSet<ProcessID>) -> Self {
        Self {
            snapshot,
            committable: BTreeSet::new(),
            uncertain: BTreeSet::new(),
        }
    }

    /// Check whether every process in the snapshot has answered.
    pub(crate) fn complete(&self) -> bool {
        self.snapshot
            .iter()
            .all(|process| self.committable.contains(process) || self.uncertain.contains(process))
    }
}

/// This process's record of one transaction.
#[derive(Clone, Debug)]
pub(crate) struct Transaction {
    pub(crate) id: TransactionID,
    pub(crate) role: Role,
    pub(crate) state: State,
    pub(crate) committed: bool,
    pub(crate) aborted: bool,
    pub(crate) payload: Payload,

    /// The process that began this transaction.
    pub(crate) origin: ProcessID,

    /// Election round. The believed coordinator is `(origin + up) mod N`.
    pub(crate) up: u64,

    /// Coordinator-only: the processes expected to vote and acknowledge.
    pub(crate) participants: BTreeSet<ProcessID>,
    pub(crate) votes: BTreeMap<ProcessID, Vote>,
    pub(crate) acks: BTreeSet<ProcessID>,
    pub(crate) waiting_on: BTreeSet<ProcessID>,
    pub(crate) termination: Option<Termination>,

    /// Set for transactions rebuilt from the durable log that are still undecided. These periodically ask
    /// every other process for the decision.
    pub(crate) recovering: bool,
    pub(crate) fenced: bool,
}

impl Transaction {
    /// Create the record of a transaction seen for the first time: a participant that has not voted.
    pub(crate) fn new(id: TransactionID, origin: ProcessID, payload: Payload) -> Self {
        Self {
            id,
            role: Role::Participant,
            state: State::Aborted,
            committed: false,
            aborted: false,
            payload,
            origin,
            up: 0,
            participants: BTreeSet::new(),
            votes: BTreeMap::new(),
            acks: BTreeSet::new(),
            waiting_on: BTreeSet::new(),
            termination: None,
            recovering: false,
            fenced: false,
        }
    }

    pub(crate) fn decision(&self) -> Option<Decision> {
        if self.committed {
            Some(Decision::Commit)
        } else if self.aborted {
            Some(Decision::Abort)
        } else {
            None
        }
    }

    pub(crate) fn is_decided(&self) -> bool {
        self.committed || self.aborted
    }

    /// Check whether this process is the coordinator and is still collecting votes.
    pub(crate) fn is_collecting_votes(&self) -> bool {
        self.role == Role::Coordinator
            && self.state == State::Aborted
            && !self.is_decided()
            && self.termination.is_none()
    }

    /// The process this process currently believes is the coordinator.
    pub(crate) fn coordinator(&self, num_processes: u32) -> ProcessID {
        let n = u64::from(num_processes.max(1));
        let index = (u64::from(self.origin.int()) + self.up) % n;
        ProcessID::new(index as u32)
    }

    /// The election round in which `process` would be the coordinator, counted in the current lap of the
    /// election sequence.
    pub(crate) fn round_of(&self, process: ProcessID, num_processes: u32) -> u64 {
        let n = u64::from(num_processes.max(1));
        let offset = (u64::from(process.int()) + n - u64::from(self.origin.int()) % n) % n;
        self.up - self.up % n + offset
    }

    pub(crate) fn snapshot(&self, num_processes: u32) -> TransactionSnapshot {
        TransactionSnapshot {
            id: self.id,
            role: self.role,
            state: self.state,
            decision: self.decision(),
            coordinator: self.coordinator(num_processes),
            payload: self.payload.clone(),
            waiting_on: self.waiting_on.clone(),
            in_termination_protocol: self.termination.is_some(),
            fenced: self.fenced,
        }
    }
}

/// A one-shot override of the vote this process casts on the next `VoteRequest` it receives.
///
/// Shared between the engine and the [`Process`](crate::process::Process) handle.
#[derive(Clone, Default)]
pub(crate) struct VoteOverride(Arc<Mutex<Option<Vote>>>);

impl VoteOverride {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, vote: Vote) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(vote);
    }

    /// Take the overridden vote if there is one, reverting to the default vote ([`Vote::Yes`]).
    pub(crate) fn take(&self) -> Vote {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default()
    }
}
