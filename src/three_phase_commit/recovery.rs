/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Rebuilding the transaction table from the durable log.
//!
//! The log holds five kinds of entries. Replaying them in order, later entries overwrite what earlier
//! entries said about the same transaction:
//!
//! | Entry                              | Recovered as                                 |
//! |------------------------------------|----------------------------------------------|
//! | `VoteRequest` sent by this process | Coordinator, `Aborted`, undecided            |
//! | `Yes` sent by this process         | Participant, `Uncertain`                     |
//! | `Precommit`                        | `Committable`; Coordinator if it sent it     |
//! | `Commit`                           | `Committed`, decided                         |
//! | `Abort`                            | `Aborted`, decided                           |
//!
//! What to do with each recovered transaction afterwards is up to the
//! [engine](super::implementation::ThreePhaseCommit::recover).

use std::collections::BTreeMap;

use crate::{
    durable_log::pluggables::LogError,
    types::data_types::{ProcessID, TransactionID},
};

use super::{
    messages::ProtocolMessage,
    types::{Role, State, Transaction},
};

/// Replay `entries`, oldest first, into a transaction table.
///
/// # Errors
///
/// An entry that this process could not have logged is reported as [`LogError::Corrupt`].
pub(crate) fn replay(
    me: ProcessID,
    entries: &[ProtocolMessage],
) -> Result<BTreeMap<TransactionID, Transaction>, LogError> {
    let mut transactions = BTreeMap::new();

    for (position, entry) in entries.iter().enumerate() {
        let transaction = transactions
            .entry(entry.transaction())
            .or_insert_with(|| {
                Transaction::new(entry.transaction(), entry.sender(), entry.payload().clone())
            });

        match entry {
            ProtocolMessage::VoteRequest(vote_request) if vote_request.envelope.sender == me => {
                transaction.role = Role::Coordinator;
                transaction.origin = me;
                transaction.participants = vote_request.participants.iter().copied().collect();
                transaction.state = State::Aborted;
            }
            ProtocolMessage::Yes(envelope) if envelope.sender == me => {
                transaction.role = Role::Participant;
                transaction.origin = envelope.destination;
                transaction.state = State::Uncertain;
            }
            ProtocolMessage::Precommit(envelope) => {
                transaction.role = if envelope.sender == me {
                    Role::Coordinator
                } else {
                    Role::Participant
                };
                transaction.state = State::Committable;
            }
            ProtocolMessage::Commit(_) => {
                transaction.committed = true;
                transaction.state = State::Committed;
            }
            ProtocolMessage::Abort(_) => {
                transaction.aborted = true;
                transaction.state = State::Aborted;
            }
            other => {
                return Err(LogError::Corrupt {
                    position,
                    reason: format!("{} is not something this process logs", other),
                })
            }
        }

        if transaction.committed && transaction.aborted {
            return Err(LogError::Corrupt {
                position,
                reason: format!(
                    "transaction {} is recorded as both committed and aborted",
                    transaction.id
                ),
            });
        }
    }

    Ok(transactions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        three_phase_commit::{messages::Envelope, types::Decision},
        types::data_types::Payload,
    };

    const ME: ProcessID = ProcessID::new(1);

    fn envelope(transaction: u64, sender: u32, destination: u32) -> Envelope {
        Envelope::new(
            TransactionID::new(transaction),
            ProcessID::new(sender),
            ProcessID::new(destination),
            Payload::new(vec![transaction as u8]),
        )
    }

    #[test]
    fn later_entries_overwrite_earlier_ones() {
        let entries = vec![
            ProtocolMessage::Yes(envelope(1, 1, 0)),
            ProtocolMessage::Yes(envelope(2, 1, 0)),
            ProtocolMessage::Precommit(envelope(2, 0, 1)),
            ProtocolMessage::Yes(envelope(3, 1, 2)),
            ProtocolMessage::Precommit(envelope(3, 2, 1)),
            ProtocolMessage::Commit(envelope(3, 1, 1)),
        ];
        let transactions = replay(ME, &entries).unwrap();

        let t1 = &transactions[&TransactionID::new(1)];
        assert_eq!((t1.role, t1.state, t1.decision()), (Role::Participant, State::Uncertain, None));
        assert_eq!(t1.origin, ProcessID::new(0));

        let t2 = &transactions[&TransactionID::new(2)];
        assert_eq!((t2.role, t2.state), (Role::Participant, State::Committable));

        let t3 = &transactions[&TransactionID::new(3)];
        assert_eq!(t3.decision(), Some(Decision::Commit));
        assert_eq!(t3.origin, ProcessID::new(2));
        assert_eq!(t3.payload, Payload::new(vec![3]));
    }

    #[test]
    fn coordinator_entries_restore_the_coordinator_role() {
        let entries = vec![
            ProtocolMessage::vote_request(envelope(4, 1, 1), vec![ProcessID::new(0), ProcessID::new(2)]),
            ProtocolMessage::vote_request(envelope(5, 1, 1), vec![ProcessID::new(0), ProcessID::new(2)]),
            ProtocolMessage::Precommit(envelope(5, 1, 1)),
        ];
        let transactions = replay(ME, &entries).unwrap();

        let t4 = &transactions[&TransactionID::new(4)];
        assert_eq!((t4.role, t4.state, t4.decision()), (Role::Coordinator, State::Aborted, None));
        assert_eq!(t4.participants.len(), 2);

        let t5 = &transactions[&TransactionID::new(5)];
        assert_eq!((t5.role, t5.state), (Role::Coordinator, State::Committable));
    }

    #[test]
    fn entries_this_process_never_logs_are_corrupt() {
        let entries = vec![
            ProtocolMessage::Yes(envelope(1, 1, 0)),
            ProtocolMessage::Ack(envelope(1, 1, 0)),
        ];
        assert!(matches!(
            replay(ME, &entries),
            Err(LogError::Corrupt { position: 1, .. })
        ));
    }

    #[test]
    fn conflicting_decisions_are_corrupt() {
        let entries = vec![
            ProtocolMessage::Abort(envelope(1, 1, 1)),
            ProtocolMessage::Commit(envelope(1, 1, 1)),
        ];
        assert!(matches!(
            replay(ME, &entries),
            Err(LogError::Corrupt { position: 1, .. })
        ));
    }
}
