/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the process's
//! [configuration](crate::process::Configuration::log_events).
//!
//! threepc_rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [Commit](crate::events::CommitEvent) is printed:
//!
//! ```text
//! Commit, 1701329264, 17, 9N0c3Xa
//! ```
//!
//! In the snippet:
//! - The third value is the ID of the committed transaction.
//! - The fourth value is the first seven characters of the Base64 encoding of the SHA-256 digest of the
//!   transaction's payload.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};
use std::time::SystemTime;

use crate::{events::*, types::data_types::Payload};

// Names of each event in PascalCase for printing:
pub const BEGIN_TRANSACTION: &str = "BeginTransaction";
pub const VOTE: &str = "Vote";
pub const PRECOMMIT: &str = "Precommit";
pub const COMMIT: &str = "Commit";
pub const ABORT: &str = "Abort";
pub const RECOVER_TRANSACTION: &str = "RecoverTransaction";

pub const RECEIVE_MESSAGE: &str = "ReceiveMessage";

pub const START_ELECTION: &str = "StartElection";
pub const BECOME_COORDINATOR: &str = "BecomeCoordinator";

pub const PROCESS_DEAD: &str = "ProcessDead";
pub const PROCESS_LIVE: &str = "ProcessLive";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for BeginTransactionEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |begin_transaction_event: &BeginTransactionEvent| {
            log::info!(
                "{}, {}, {}, {}",
                BEGIN_TRANSACTION,
                secs_since_unix_epoch(begin_transaction_event.timestamp),
                begin_transaction_event.transaction,
                payload_digest(&begin_transaction_event.payload)
            )
        };
        Box::new(logger)
    }
}

impl Logger for VoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |vote_event: &VoteEvent| {
            log::info!(
                "{}, {}, {}, {}, {:?}",
                VOTE,
                secs_since_unix_epoch(vote_event.timestamp),
                vote_event.transaction,
                vote_event.coordinator,
                vote_event.vote
            )
        };
        Box::new(logger)
    }
}

impl Logger for PrecommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |precommit_event: &PrecommitEvent| {
            log::info!(
                "{}, {}, {}, {:?}",
                PRECOMMIT,
                secs_since_unix_epoch(precommit_event.timestamp),
                precommit_event.transaction,
                precommit_event.role
            )
        };
        Box::new(logger)
    }
}

impl Logger for CommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |commit_event: &CommitEvent| {
            log::info!(
                "{}, {}, {}, {}",
                COMMIT,
                secs_since_unix_epoch(commit_event.timestamp),
                commit_event.transaction,
                payload_digest(&commit_event.payload)
            )
        };
        Box::new(logger)
    }
}

impl Logger for AbortEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |abort_event: &AbortEvent| {
            log::info!(
                "{}, {}, {}",
                ABORT,
                secs_since_unix_epoch(abort_event.timestamp),
                abort_event.transaction
            )
        };
        Box::new(logger)
    }
}

impl Logger for RecoverTransactionEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |recover_transaction_event: &RecoverTransactionEvent| {
            log::info!(
                "{}, {}, {}, {:?}, {:?}",
                RECOVER_TRANSACTION,
                secs_since_unix_epoch(recover_transaction_event.timestamp),
                recover_transaction_event.transaction,
                recover_transaction_event.role,
                recover_transaction_event.state
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveMessageEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_message_event: &ReceiveMessageEvent| {
            let message = &receive_message_event.message;
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_MESSAGE,
                secs_since_unix_epoch(receive_message_event.timestamp),
                message.kind(),
                message.transaction(),
                message.sender()
            )
        };
        Box::new(logger)
    }
}

impl Logger for StartElectionEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_election_event: &StartElectionEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                START_ELECTION,
                secs_since_unix_epoch(start_election_event.timestamp),
                start_election_event.transaction,
                start_election_event.failed_coordinator,
                start_election_event.candidate
            )
        };
        Box::new(logger)
    }
}

impl Logger for BecomeCoordinatorEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |become_coordinator_event: &BecomeCoordinatorEvent| {
            log::info!(
                "{}, {}, {}, {}",
                BECOME_COORDINATOR,
                secs_since_unix_epoch(become_coordinator_event.timestamp),
                become_coordinator_event.transaction,
                become_coordinator_event.termination_participants.len()
            )
        };
        Box::new(logger)
    }
}

impl Logger for ProcessDeadEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |process_dead_event: &ProcessDeadEvent| {
            log::info!(
                "{}, {}, {}",
                PROCESS_DEAD,
                secs_since_unix_epoch(process_dead_event.timestamp),
                process_dead_event.process
            )
        };
        Box::new(logger)
    }
}

impl Logger for ProcessLiveEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |process_live_event: &ProcessLiveEvent| {
            log::info!(
                "{}, {}, {}",
                PROCESS_LIVE,
                secs_since_unix_epoch(process_live_event.timestamp),
                process_live_event.process
            )
        };
        Box::new(logger)
    }
}

fn payload_digest(payload: &Payload) -> String {
    first_seven_base64_chars(Sha256::digest(payload.bytes()).as_slice())
}

fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
