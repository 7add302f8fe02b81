/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The Three-Phase Commit (3PC) subprotocol, including its termination protocol.
//!
//! # Protocol overview
//!
//! Each transaction is driven by a *coordinator*, initially the process that began it. The coordinator
//! sends a [`VoteRequest`](messages::ProtocolMessage::VoteRequest) to every other process (the
//! *participants*), which vote Yes or No. If every participant votes Yes, the coordinator sends a
//! [`Precommit`](messages::ProtocolMessage::Precommit), collects acknowledgements, and finally sends
//! [`Commit`](messages::ProtocolMessage::Commit). Any No vote leads to an ABORT decision.
//!
//! Compared to Two-Phase Commit, the extra *precommit* round means that no process can be COMMITTED while
//! another is still UNCERTAIN. This lets the surviving processes finish a transaction on their own when
//! the coordinator crashes:
//! 1. A participant whose coordinator is reported dead by the [failure monitor](crate::failure_monitor)
//!    *elects* the next coordinator by sending it a
//!    [`YouAreElected`](messages::ProtocolMessage::YouAreElected).
//! 2. The elected coordinator asks every live process for its state with a
//!    [`StateRequest`](messages::ProtocolMessage::StateRequest).
//! 3. If anyone already knows the decision, that decision is adopted. Otherwise, if at least one process
//!    is COMMITTABLE, the elected coordinator resumes the precommit round. If everyone is UNCERTAIN, no
//!    process can have committed, so it decides ABORT.
//!
//! # Election rule
//!
//! Every process remembers the *origin* of each transaction (the process that began it) and an election
//! round `up`. The coordinator a process believes in is `(origin + up) mod N`. Each time the believed
//! coordinator times out, `up` increases by one. A `StateRequest` from a process later in the sequence
//! moves `up` forward to that process.
//!
//! # Durability
//!
//! Every step that could affect a decision (a vote, a precommit, a decision) is appended to the
//! [durable log](crate::durable_log) *before* any message that depends on it is enqueued. After a crash,
//! [`recovery`] rebuilds the transaction table from the log.

pub mod messages;

pub mod types;

pub(crate) mod implementation;

pub(crate) mod recovery;

pub use implementation::ThreePhaseCommitError;
