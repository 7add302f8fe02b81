/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The closed set of messages exchanged by the three-phase commit protocol.
//!
//! Every [`ProtocolMessage`] carries an [`Envelope`]: the transaction it is about, who sent it, who it is
//! for, and the transaction's opaque [`Payload`]. The same messages are appended to the
//! [durable log](crate::durable_log) to record what this process has done, so a logged message is simply
//! one whose sender and destination are both this process.
//!
//! [`Abort`](ProtocolMessage::Abort) is used both as a "No" vote and as the notice of an ABORT decision.
//! The two are logically equivalent: a No vote is enough to decide ABORT.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::data_types::{Payload, ProcessID, TransactionID};

/// Fields common to every [`ProtocolMessage`].
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Envelope {
    pub transaction: TransactionID,
    pub sender: ProcessID,
    pub destination: ProcessID,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(
        transaction: TransactionID,
        sender: ProcessID,
        destination: ProcessID,
        payload: Payload,
    ) -> Self {
        Self {
            transaction,
            sender,
            destination,
            payload,
        }
    }
}

/// A request to vote on a transaction, sent by its coordinator to every participant.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct VoteRequest {
    pub envelope: Envelope,

    /// Every process other than the coordinator that takes part in the transaction.
    pub participants: Vec<ProcessID>,
}

/// All message variants used in the three-phase commit protocol.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum ProtocolMessage {
    /// Local trigger that makes this process the coordinator of a new transaction. Never sent over the
    /// network.
    BeginProtocol(Envelope),

    /// Coordinator → participant: please vote. Logged by the coordinator when it starts a transaction.
    VoteRequest(VoteRequest),

    /// Participant → coordinator: a Yes vote.
    Yes(Envelope),

    /// Either a No vote, or the notice that the transaction was decided ABORT.
    Abort(Envelope),

    /// Coordinator → participant: every participant voted Yes, so commit is forthcoming.
    Precommit(Envelope),

    /// Participant → coordinator: acknowledgement of a `Precommit`.
    Ack(Envelope),

    /// The notice that the transaction was decided COMMIT.
    Commit(Envelope),

    /// Elected coordinator → participant: report your state.
    StateRequest(Envelope),

    /// Response to a `StateRequest`: I have received a `Precommit` but not a decision.
    Committable(Envelope),

    /// Response to a `StateRequest`: I have voted Yes but not received a `Precommit` or a decision.
    Uncertain(Envelope),

    /// Sent by a process that recovered from a crash: tell me the decision if you know it.
    DecisionRequest(Envelope),

    /// Local event synthesized when a process this process is waiting on is reported dead. The sender is
    /// the dead process. Never sent over the network.
    Timeout(Envelope),

    /// Participant → next coordinator: you have been elected to terminate the transaction.
    YouAreElected(Envelope),
}

impl ProtocolMessage {
    /// Create a [`VoteRequest`](ProtocolMessage::VoteRequest).
    pub fn vote_request(envelope: Envelope, participants: Vec<ProcessID>) -> Self {
        ProtocolMessage::VoteRequest(VoteRequest {
            envelope,
            participants,
        })
    }

    /// Get the envelope of this message.
    pub fn envelope(&self) -> &Envelope {
        match self {
            ProtocolMessage::VoteRequest(vote_request) => &vote_request.envelope,
            ProtocolMessage::BeginProtocol(envelope)
            | ProtocolMessage::Yes(envelope)
            | ProtocolMessage::Abort(envelope)
            | ProtocolMessage::Precommit(envelope)
            | ProtocolMessage::Ack(envelope)
            | ProtocolMessage::Commit(envelope)
            | ProtocolMessage::StateRequest(envelope)
            | ProtocolMessage::Committable(envelope)
            | ProtocolMessage::Uncertain(envelope)
            | ProtocolMessage::DecisionRequest(envelope)
            | ProtocolMessage::Timeout(envelope)
            | ProtocolMessage::YouAreElected(envelope) => envelope,
        }
    }

    /// Get the `transaction` field of the inner envelope.
    pub fn transaction(&self) -> TransactionID {
        self.envelope().transaction
    }

    /// Get the `sender` field of the inner envelope.
    pub fn sender(&self) -> ProcessID {
        self.envelope().sender
    }

    /// Get the `destination` field of the inner envelope.
    pub fn destination(&self) -> ProcessID {
        self.envelope().destination
    }

    /// Get the `payload` field of the inner envelope.
    pub fn payload(&self) -> &Payload {
        &self.envelope().payload
    }

    /// Get the name of this message's variant in PascalCase.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::BeginProtocol(_) => "BeginProtocol",
            ProtocolMessage::VoteRequest(_) => "VoteRequest",
            ProtocolMessage::Yes(_) => "Yes",
            ProtocolMessage::Abort(_) => "Abort",
            ProtocolMessage::Precommit(_) => "Precommit",
            ProtocolMessage::Ack(_) => "Ack",
            ProtocolMessage::Commit(_) => "Commit",
            ProtocolMessage::StateRequest(_) => "StateRequest",
            ProtocolMessage::Committable(_) => "Committable",
            ProtocolMessage::Uncertain(_) => "Uncertain",
            ProtocolMessage::DecisionRequest(_) => "DecisionRequest",
            ProtocolMessage::Timeout(_) => "Timeout",
            ProtocolMessage::YouAreElected(_) => "YouAreElected",
        }
    }

    /// Check whether this message is a local-only event that must never be handed to the network.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ProtocolMessage::BeginProtocol(_) | ProtocolMessage::Timeout(_)
        )
    }
}

impl Display for ProtocolMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let envelope = self.envelope();
        write!(
            f,
            "{} [transaction={}, sender={}, destination={}]",
            self.kind(),
            envelope.transaction,
            envelope.sender,
            envelope.destination
        )
    }
}

/// A participant's answer to a [`VoteRequest`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Vote {
    Yes,
    No,
}

impl Default for Vote {
    fn default() -> Self {
        Vote::Yes
    }
}
