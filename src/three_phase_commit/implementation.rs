/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Event-driven implementation of the three-phase commit subprotocol.
//!
//! Main type: [`ThreePhaseCommit`].

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt::{self, Display, Formatter},
    sync::mpsc::Sender,
    time::SystemTime,
};

use crate::{
    app::App,
    durable_log::pluggables::{DurableLog, LogError},
    events::{
        AbortEvent, BecomeCoordinatorEvent, BeginTransactionEvent, CommitEvent, Event,
        PrecommitEvent, ReceiveMessageEvent, RecoverTransactionEvent, StartElectionEvent,
        VoteEvent,
    },
    types::data_types::{ProcessID, TransactionID},
};

use super::{
    messages::{Envelope, ProtocolMessage, Vote, VoteRequest},
    recovery,
    types::{
        Decision, Role, State, Termination, Transaction, TransactionSnapshot, VoteOverride,
    },
};

/// Constructor of a protocol message from its envelope, e.g., `ProtocolMessage::Commit`.
type MessageConstructor = fn(Envelope) -> ProtocolMessage;

/// Immutable parameters that define the behavior of a [`ThreePhaseCommit`].
#[derive(Clone, Debug)]
pub(crate) struct ThreePhaseCommitConfiguration {
    pub(crate) me: ProcessID,
    pub(crate) num_processes: u32,
}

/// A single process's instance of the three-phase commit subprotocol.
///
/// # Usage
///
/// After creating an instance with [`new`](Self::new) and calling [`recover`](Self::recover) once, the
/// caller interacts with it through:
/// 1. [`on_receive_msg`](Self::on_receive_msg): called for every protocol message received from the
///    network, every `BeginProtocol` requested by the user, and every `Timeout` returned by
///    [`timeouts`](Self::timeouts), in that order.
/// 2. [`timeouts`](Self::timeouts): called every main loop iteration with the failure monitor's dead set.
/// 3. [`retry_decision_requests`](Self::retry_decision_requests): called periodically.
/// 4. [`drain_outbox`](Self::drain_outbox): returns the messages to send, oldest first.
///
/// # Errors
///
/// The only errors are durable log errors. An append failure fences the transaction it was for: nothing
/// that depended on the failed append is sent, and the transaction makes no further progress.
pub(crate) struct ThreePhaseCommit<L: DurableLog, A: App> {
    transactions: BTreeMap<TransactionID, Transaction>,
    updated: BTreeSet<TransactionID>,
    context: Context<L, A>,
}

/// Everything besides the transaction table. Kept apart so that a handler can hold a `&mut Transaction`
/// from the table and a `&mut Context` at the same time.
struct Context<L: DurableLog, A: App> {
    config: ThreePhaseCommitConfiguration,
    durable_log: L,
    app: A,
    outbox: VecDeque<ProtocolMessage>,
    vote_override: VoteOverride,
    event_publisher: Option<Sender<Event>>,
}

impl<L: DurableLog, A: App> ThreePhaseCommit<L, A> {
    pub(crate) fn new(
        config: ThreePhaseCommitConfiguration,
        durable_log: L,
        app: A,
        vote_override: VoteOverride,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        Self {
            transactions: BTreeMap::new(),
            updated: BTreeSet::new(),
            context: Context {
                config,
                durable_log,
                app,
                outbox: VecDeque::new(),
                vote_override,
                event_publisher,
            },
        }
    }

    /// Rebuild the transaction table from the durable log, then let every other process know what this
    /// process knows:
    /// - Decided transactions re-broadcast their decision to the `live` processes. Committed ones are
    ///   also applied to the app if the app has not seen them.
    /// - A coordinator that never precommitted decides ABORT, since no process can be committable.
    /// - Undecided transactions ask every other process for the decision.
    pub(crate) fn recover(
        &mut self,
        live: &BTreeSet<ProcessID>,
    ) -> Result<(), ThreePhaseCommitError> {
        let entries = self
            .context
            .durable_log
            .read_all()
            .map_err(ThreePhaseCommitError::LogRead)?;
        let recovered = recovery::replay(self.context.config.me, &entries)
            .map_err(ThreePhaseCommitError::LogRead)?;

        for (id, transaction) in recovered {
            Event::RecoverTransaction(RecoverTransactionEvent {
                timestamp: SystemTime::now(),
                transaction: id,
                role: transaction.role,
                state: transaction.state,
            })
            .publish(&self.context.event_publisher);

            self.updated.insert(id);
            let transaction = self.transactions.entry(id).or_insert(transaction);
            self.context.on_recover(transaction, live)?;
        }

        Ok(())
    }

    /// Execute the required steps of the protocol upon receiving `msg`. `live` is the failure monitor's
    /// current live set, used as the termination protocol's snapshot if this process gets elected.
    pub(crate) fn on_receive_msg(
        &mut self,
        msg: ProtocolMessage,
        live: &BTreeSet<ProcessID>,
    ) -> Result<(), ThreePhaseCommitError> {
        if !msg.is_local() {
            Event::ReceiveMessage(ReceiveMessageEvent {
                timestamp: SystemTime::now(),
                message: msg.clone(),
            })
            .publish(&self.context.event_publisher);
        }

        let id = msg.transaction();
        if matches!(msg, ProtocolMessage::BeginProtocol(_)) && self.transactions.contains_key(&id) {
            log::warn!("Ignoring request to begin transaction {}, which already exists", id);
            return Ok(());
        }

        // First contact with a transaction creates a record with the safe default: a participant that
        // has not voted.
        let transaction = self
            .transactions
            .entry(id)
            .or_insert_with(|| Transaction::new(id, msg.sender(), msg.payload().clone()));
        self.updated.insert(id);

        if transaction.fenced {
            log::debug!("Ignoring {} for fenced transaction {}", msg.kind(), id);
            return Ok(());
        }

        let context = &mut self.context;
        match msg {
            ProtocolMessage::BeginProtocol(_) => context.on_begin_protocol(transaction),
            ProtocolMessage::VoteRequest(vote_request) => {
                context.on_vote_request(transaction, vote_request)
            }
            ProtocolMessage::Yes(envelope) => context.on_vote(transaction, envelope.sender, Vote::Yes),
            ProtocolMessage::Abort(envelope) => context.on_abort(transaction, envelope.sender),
            ProtocolMessage::Precommit(envelope) => {
                context.on_precommit(transaction, envelope.sender)
            }
            ProtocolMessage::Ack(envelope) => context.on_ack(transaction, envelope.sender),
            ProtocolMessage::Commit(envelope) => context.on_commit(transaction, envelope.sender),
            ProtocolMessage::StateRequest(envelope) => {
                context.on_state_request(transaction, envelope.sender)
            }
            ProtocolMessage::Committable(envelope) => {
                context.on_state_report(transaction, envelope.sender, State::Committable)
            }
            ProtocolMessage::Uncertain(envelope) => {
                context.on_state_report(transaction, envelope.sender, State::Uncertain)
            }
            ProtocolMessage::DecisionRequest(envelope) => {
                context.on_decision_request(transaction, envelope.sender);
                Ok(())
            }
            ProtocolMessage::Timeout(envelope) => {
                context.on_timeout(transaction, envelope.sender, live)
            }
            ProtocolMessage::YouAreElected(_) => context.on_you_are_elected(transaction, live),
        }
    }

    /// Synthesize a `Timeout` for every undecided transaction that is waiting on a process in `dead`.
    ///
    /// Timeouts are level-triggered: as long as a dead process stays in a transaction's waiting set, a
    /// `Timeout` is returned for it on every call.
    pub(crate) fn timeouts(&self, dead: &BTreeSet<ProcessID>) -> Vec<ProtocolMessage> {
        let me = self.context.config.me;
        self.transactions
            .values()
            .filter(|transaction| !transaction.is_decided() && !transaction.fenced)
            .flat_map(move |transaction| {
                transaction.waiting_on.intersection(dead).map(move |process| {
                    ProtocolMessage::Timeout(Envelope::new(
                        transaction.id,
                        *process,
                        me,
                        transaction.payload.clone(),
                    ))
                })
            })
            .collect()
    }

    /// Ask every other process for the decision of each recovered transaction that is still undecided.
    pub(crate) fn retry_decision_requests(&mut self) {
        for transaction in self.transactions.values() {
            if transaction.recovering && !transaction.is_decided() && !transaction.fenced {
                self.context.request_decision(transaction);
            }
        }
    }

    /// Take every enqueued message, oldest first.
    pub(crate) fn drain_outbox(&mut self) -> Vec<ProtocolMessage> {
        self.context.outbox.drain(..).collect()
    }

    pub(crate) fn transaction(&self, id: TransactionID) -> Option<TransactionSnapshot> {
        self.transactions
            .get(&id)
            .map(|transaction| transaction.snapshot(self.context.config.num_processes))
    }

    /// Snapshots of every transaction touched since the last call.
    pub(crate) fn take_updated_snapshots(&mut self) -> Vec<TransactionSnapshot> {
        let num_processes = self.context.config.num_processes;
        std::mem::take(&mut self.updated)
            .into_iter()
            .filter_map(|id| self.transactions.get(&id))
            .map(|transaction| transaction.snapshot(num_processes))
            .collect()
    }

    #[cfg(test)]
    fn app(&self) -> &A {
        &self.context.app
    }
}

impl<L: DurableLog, A: App> Context<L, A> {
    fn me(&self) -> ProcessID {
        self.config.me
    }

    /// Every process except this one.
    fn others(&self) -> BTreeSet<ProcessID> {
        self.config.me.others(self.config.num_processes).collect()
    }

    /// Append `entry` to the durable log. If that fails, fence `transaction`.
    fn log_entry(
        &mut self,
        transaction: &mut Transaction,
        entry: ProtocolMessage,
    ) -> Result<(), ThreePhaseCommitError> {
        if let Err(source) = self.durable_log.append(&entry) {
            log::error!(
                "Failed to log {}: {}. Transaction {} makes no further progress at process {}.",
                entry,
                source,
                transaction.id,
                self.me()
            );
            transaction.fenced = true;
            transaction.waiting_on.clear();
            return Err(ThreePhaseCommitError::LogAppend {
                transaction: transaction.id,
                source,
            });
        }
        Ok(())
    }

    /// An entry about `transaction` that this process logs on its own behalf.
    fn own_entry(&self, transaction: &Transaction, message: MessageConstructor) -> ProtocolMessage {
        message(Envelope::new(
            transaction.id,
            self.me(),
            self.me(),
            transaction.payload.clone(),
        ))
    }

    fn send(&mut self, transaction: &Transaction, destination: ProcessID, message: MessageConstructor) {
        self.outbox.push_back(message(Envelope::new(
            transaction.id,
            self.me(),
            destination,
            transaction.payload.clone(),
        )))
    }

    fn broadcast(
        &mut self,
        transaction: &Transaction,
        destinations: impl IntoIterator<Item = ProcessID>,
        message: MessageConstructor,
    ) {
        for destination in destinations {
            if destination != self.me() {
                self.send(transaction, destination, message)
            }
        }
    }

    fn request_decision(&mut self, transaction: &Transaction) {
        let others = self.others();
        self.broadcast(transaction, others, ProtocolMessage::DecisionRequest)
    }

    /// Decide COMMIT, unless `transaction` is already decided. Returns whether this call made the decision.
    fn decide_commit(&mut self, transaction: &mut Transaction) -> Result<bool, ThreePhaseCommitError> {
        if transaction.committed {
            return Ok(false);
        }
        if transaction.aborted {
            log::error!(
                "Process {} refusing to commit transaction {}, which it already aborted",
                self.me(),
                transaction.id
            );
            return Ok(false);
        }

        let entry = self.own_entry(transaction, ProtocolMessage::Commit);
        self.log_entry(transaction, entry)?;
        transaction.committed = true;
        transaction.state = State::Committed;
        transaction.waiting_on.clear();
        transaction.termination = None;
        transaction.recovering = false;
        if !self.app.is_applied(transaction.id) {
            self.app.apply(transaction.id, &transaction.payload);
        }

        Event::Commit(CommitEvent {
            timestamp: SystemTime::now(),
            transaction: transaction.id,
            payload: transaction.payload.clone(),
        })
        .publish(&self.event_publisher);

        Ok(true)
    }

    /// Decide ABORT, unless `transaction` is already decided. Returns whether this call made the decision.
    fn decide_abort(&mut self, transaction: &mut Transaction) -> Result<bool, ThreePhaseCommitError> {
        if transaction.aborted {
            return Ok(false);
        }
        if transaction.committed {
            log::error!(
                "Process {} refusing to abort transaction {}, which it already committed",
                self.me(),
                transaction.id
            );
            return Ok(false);
        }

        let entry = self.own_entry(transaction, ProtocolMessage::Abort);
        self.log_entry(transaction, entry)?;
        transaction.aborted = true;
        transaction.state = State::Aborted;
        transaction.waiting_on.clear();
        transaction.termination = None;
        transaction.recovering = false;

        Event::Abort(AbortEvent {
            timestamp: SystemTime::now(),
            transaction: transaction.id,
        })
        .publish(&self.event_publisher);

        Ok(true)
    }

    /// If `sender` is at least as late in the election sequence as the believed coordinator, start
    /// following it, stepping down if this process was coordinating. Returns whether `sender` is followed.
    fn follow(&mut self, transaction: &mut Transaction, sender: ProcessID) -> bool {
        let round = transaction.round_of(sender, self.config.num_processes);
        if round < transaction.up {
            return false;
        }
        transaction.up = round;
        if sender != self.me() && transaction.role == Role::Coordinator {
            log::debug!(
                "Process {} stepping down as coordinator of transaction {} in favor of process {}",
                self.me(),
                transaction.id,
                sender
            );
            transaction.role = Role::Participant;
            transaction.termination = None;
            transaction.votes.clear();
            transaction.acks.clear();
        }
        true
    }

    fn on_begin_protocol(&mut self, transaction: &mut Transaction) -> Result<(), ThreePhaseCommitError> {
        let me = self.me();
        let participants = self.others();
        let participant_list: Vec<ProcessID> = participants.iter().copied().collect();

        transaction.role = Role::Coordinator;
        transaction.origin = me;
        transaction.up = 0;
        transaction.participants = participants.clone();

        let entry = ProtocolMessage::vote_request(
            Envelope::new(transaction.id, me, me, transaction.payload.clone()),
            participant_list.clone(),
        );
        self.log_entry(transaction, entry)?;

        Event::BeginTransaction(BeginTransactionEvent {
            timestamp: SystemTime::now(),
            transaction: transaction.id,
            payload: transaction.payload.clone(),
        })
        .publish(&self.event_publisher);

        for participant in &participants {
            self.outbox.push_back(ProtocolMessage::vote_request(
                Envelope::new(transaction.id, me, *participant, transaction.payload.clone()),
                participant_list.clone(),
            ));
        }
        transaction.waiting_on = participants;

        self.end_voting_if_complete(transaction)
    }

    fn on_vote_request(
        &mut self,
        transaction: &mut Transaction,
        vote_request: VoteRequest,
    ) -> Result<(), ThreePhaseCommitError> {
        let coordinator = vote_request.envelope.sender;

        if let Some(decision) = transaction.decision() {
            self.send(transaction, coordinator, decision_message(decision));
            return Ok(());
        }
        if transaction.role == Role::Coordinator || transaction.state != State::Aborted {
            log::debug!(
                "Process {} ignoring repeated VoteRequest for transaction {}",
                self.me(),
                transaction.id
            );
            return Ok(());
        }

        transaction.origin = coordinator;
        transaction.up = 0;

        let vote = self.vote_override.take();
        match vote {
            Vote::Yes => {
                let entry = ProtocolMessage::Yes(Envelope::new(
                    transaction.id,
                    self.me(),
                    coordinator,
                    transaction.payload.clone(),
                ));
                self.log_entry(transaction, entry)?;
                transaction.state = State::Uncertain;
                transaction.waiting_on = BTreeSet::from([coordinator]);
                self.send(transaction, coordinator, ProtocolMessage::Yes);
            }
            Vote::No => {
                self.decide_abort(transaction)?;
                self.send(transaction, coordinator, ProtocolMessage::Abort);
            }
        }

        Event::Vote(VoteEvent {
            timestamp: SystemTime::now(),
            transaction: transaction.id,
            coordinator,
            vote,
        })
        .publish(&self.event_publisher);

        Ok(())
    }

    fn on_vote(
        &mut self,
        transaction: &mut Transaction,
        sender: ProcessID,
        vote: Vote,
    ) -> Result<(), ThreePhaseCommitError> {
        if let Some(decision) = transaction.decision() {
            // A late Yes voter is still waiting to hear from the coordinator.
            if vote == Vote::Yes {
                self.send(transaction, sender, decision_message(decision));
            }
            return Ok(());
        }
        if !transaction.is_collecting_votes() || !transaction.participants.contains(&sender) {
            log::debug!(
                "Process {} ignoring vote from process {} on transaction {}",
                self.me(),
                sender,
                transaction.id
            );
            return Ok(());
        }

        transaction.votes.entry(sender).or_insert(vote);
        transaction.waiting_on.remove(&sender);
        self.end_voting_if_complete(transaction)
    }

    /// Once every participant has voted, precommit if every vote was Yes, and abort otherwise.
    fn end_voting_if_complete(
        &mut self,
        transaction: &mut Transaction,
    ) -> Result<(), ThreePhaseCommitError> {
        if transaction.votes.len() < transaction.participants.len() {
            return Ok(());
        }

        if transaction.votes.values().all(|vote| *vote == Vote::Yes) {
            let entry = self.own_entry(transaction, ProtocolMessage::Precommit);
            self.log_entry(transaction, entry)?;
            transaction.state = State::Committable;
            transaction.acks.clear();
            transaction.waiting_on = transaction.participants.clone();

            Event::Precommit(PrecommitEvent {
                timestamp: SystemTime::now(),
                transaction: transaction.id,
                role: transaction.role,
            })
            .publish(&self.event_publisher);

            let participants = transaction.participants.clone();
            self.broadcast(transaction, participants, ProtocolMessage::Precommit);
            self.commit_if_acknowledged(transaction)
        } else {
            if self.decide_abort(transaction)? {
                let participants = transaction.participants.clone();
                self.broadcast(transaction, participants, ProtocolMessage::Abort);
            }
            Ok(())
        }
    }

    /// Commit once every participant has acknowledged the precommit.
    fn commit_if_acknowledged(
        &mut self,
        transaction: &mut Transaction,
    ) -> Result<(), ThreePhaseCommitError> {
        if transaction.participants.is_subset(&transaction.acks) {
            self.commit_and_notify_acknowledgers(transaction)?;
        }
        Ok(())
    }

    fn commit_and_notify_acknowledgers(
        &mut self,
        transaction: &mut Transaction,
    ) -> Result<(), ThreePhaseCommitError> {
        if self.decide_commit(transaction)? {
            let acks = transaction.acks.clone();
            self.broadcast(transaction, acks, ProtocolMessage::Commit);
        }
        Ok(())
    }

    fn on_abort(
        &mut self,
        transaction: &mut Transaction,
        sender: ProcessID,
    ) -> Result<(), ThreePhaseCommitError> {
        if transaction.is_collecting_votes() && transaction.participants.contains(&sender) {
            return self.on_vote(transaction, sender, Vote::No);
        }
        self.adopt_decision(transaction, Decision::Abort)
    }

    fn on_commit(
        &mut self,
        transaction: &mut Transaction,
        sender: ProcessID,
    ) -> Result<(), ThreePhaseCommitError> {
        log::debug!(
            "Process {} received Commit for transaction {} from process {}",
            self.me(),
            transaction.id,
            sender
        );
        self.adopt_decision(transaction, Decision::Commit)
    }

    /// Apply a decision learned from another process. An elected coordinator passes it on to its
    /// termination participants.
    fn adopt_decision(
        &mut self,
        transaction: &mut Transaction,
        decision: Decision,
    ) -> Result<(), ThreePhaseCommitError> {
        let termination_participants = transaction
            .termination
            .as_ref()
            .map(|termination| termination.snapshot.clone());

        let decided = match decision {
            Decision::Commit => self.decide_commit(transaction)?,
            Decision::Abort => self.decide_abort(transaction)?,
        };

        if decided {
            if let Some(termination_participants) = termination_participants {
                self.broadcast(transaction, termination_participants, decision_message(decision));
            }
        }
        Ok(())
    }

    fn on_precommit(
        &mut self,
        transaction: &mut Transaction,
        sender: ProcessID,
    ) -> Result<(), ThreePhaseCommitError> {
        match transaction.decision() {
            Some(Decision::Commit) => {
                self.send(transaction, sender, ProtocolMessage::Commit);
                return Ok(());
            }
            Some(Decision::Abort) => {
                log::error!(
                    "Process {} received Precommit for transaction {}, which it already aborted",
                    self.me(),
                    transaction.id
                );
                self.send(transaction, sender, ProtocolMessage::Abort);
                return Ok(());
            }
            None => (),
        }

        self.follow(transaction, sender);

        match transaction.state {
            State::Uncertain => {
                let entry = ProtocolMessage::Precommit(Envelope::new(
                    transaction.id,
                    sender,
                    self.me(),
                    transaction.payload.clone(),
                ));
                self.log_entry(transaction, entry)?;
                transaction.state = State::Committable;

                Event::Precommit(PrecommitEvent {
                    timestamp: SystemTime::now(),
                    transaction: transaction.id,
                    role: transaction.role,
                })
                .publish(&self.event_publisher);
            }
            State::Committable => (),
            State::Aborted | State::Committed => {
                log::warn!(
                    "Process {} ignoring Precommit for transaction {}, on which it has not voted Yes",
                    self.me(),
                    transaction.id
                );
                return Ok(());
            }
        }

        self.send(transaction, sender, ProtocolMessage::Ack);
        if transaction.role == Role::Participant {
            let coordinator = transaction.coordinator(self.config.num_processes);
            transaction.waiting_on = BTreeSet::from([coordinator]);
        }
        Ok(())
    }

    fn on_ack(
        &mut self,
        transaction: &mut Transaction,
        sender: ProcessID,
    ) -> Result<(), ThreePhaseCommitError> {
        if transaction.committed {
            self.send(transaction, sender, ProtocolMessage::Commit);
            return Ok(());
        }
        if transaction.role != Role::Coordinator
            || transaction.state != State::Committable
            || transaction.termination.is_some()
            || !transaction.participants.contains(&sender)
        {
            log::debug!(
                "Process {} ignoring Ack from process {} on transaction {}",
                self.me(),
                sender,
                transaction.id
            );
            return Ok(());
        }

        transaction.acks.insert(sender);
        transaction.waiting_on.remove(&sender);
        self.commit_if_acknowledged(transaction)
    }

    fn on_state_request(
        &mut self,
        transaction: &mut Transaction,
        sender: ProcessID,
    ) -> Result<(), ThreePhaseCommitError> {
        if let Some(decision) = transaction.decision() {
            self.send(transaction, sender, decision_message(decision));
            return Ok(());
        }

        let following = self.follow(transaction, sender);

        match transaction.state {
            // Not having voted Yes, this process can decide ABORT unilaterally.
            State::Aborted | State::Committed => {
                self.decide_abort(transaction)?;
                self.send(transaction, sender, ProtocolMessage::Abort);
            }
            State::Uncertain => self.send(transaction, sender, ProtocolMessage::Uncertain),
            State::Committable => self.send(transaction, sender, ProtocolMessage::Committable),
        }

        if following && !transaction.is_decided() {
            transaction.waiting_on = BTreeSet::from([sender]);
        }
        Ok(())
    }

    fn on_state_report(
        &mut self,
        transaction: &mut Transaction,
        sender: ProcessID,
        state: State,
    ) -> Result<(), ThreePhaseCommitError> {
        if transaction.termination.is_none() {
            log::debug!(
                "Process {} ignoring {:?} report from process {} on transaction {}",
                self.me(),
                state,
                sender,
                transaction.id
            );
            return Ok(());
        }
        let Some(termination) = transaction
            .termination
            .as_mut()
            .filter(|termination| termination.snapshot.contains(&sender))
        else {
            return Ok(());
        };

        if state == State::Committable {
            termination.committable.insert(sender);
        } else {
            termination.uncertain.insert(sender);
        }
        transaction.waiting_on.remove(&sender);

        self.finish_termination_if_complete(transaction)
    }

    /// Once every termination participant has reported its state, resume the precommit round if anyone
    /// (this process included) is committable, and abort otherwise.
    fn finish_termination_if_complete(
        &mut self,
        transaction: &mut Transaction,
    ) -> Result<(), ThreePhaseCommitError> {
        let Some(termination) = &transaction.termination else {
            return Ok(());
        };
        if !termination.complete() {
            return Ok(());
        }

        let termination_participants = termination.snapshot.clone();
        let anyone_committable =
            !termination.committable.is_empty() || transaction.state == State::Committable;

        if anyone_committable {
            if transaction.state != State::Committable {
                let entry = self.own_entry(transaction, ProtocolMessage::Precommit);
                self.log_entry(transaction, entry)?;
                transaction.state = State::Committable;

                Event::Precommit(PrecommitEvent {
                    timestamp: SystemTime::now(),
                    transaction: transaction.id,
                    role: transaction.role,
                })
                .publish(&self.event_publisher);
            }

            transaction.termination = None;
            transaction.participants = termination_participants.clone();
            transaction.acks.clear();
            transaction.waiting_on = termination_participants.clone();
            self.broadcast(transaction, termination_participants, ProtocolMessage::Precommit);
            self.commit_if_acknowledged(transaction)
        } else {
            if self.decide_abort(transaction)? {
                self.broadcast(transaction, termination_participants, ProtocolMessage::Abort);
            }
            Ok(())
        }
    }

    fn on_decision_request(&mut self, transaction: &Transaction, sender: ProcessID) {
        // An undecided process stays silent; the requester will ask again.
        if let Some(decision) = transaction.decision() {
            self.send(transaction, sender, decision_message(decision));
        }
    }

    fn on_timeout(
        &mut self,
        transaction: &mut Transaction,
        failed: ProcessID,
        live: &BTreeSet<ProcessID>,
    ) -> Result<(), ThreePhaseCommitError> {
        if transaction.is_decided() || !transaction.waiting_on.contains(&failed) {
            return Ok(());
        }

        match transaction.role {
            Role::Coordinator => {
                if let Some(termination) = transaction.termination.as_mut() {
                    termination.snapshot.remove(&failed);
                    transaction.waiting_on.remove(&failed);
                    self.finish_termination_if_complete(transaction)
                } else if transaction.is_collecting_votes() {
                    self.on_vote(transaction, failed, Vote::No)
                } else if transaction.state == State::Committable {
                    // Every live participant has logged the precommit, so the missing Ack is no
                    // obstacle to committing.
                    self.commit_and_notify_acknowledgers(transaction)
                } else {
                    transaction.waiting_on.remove(&failed);
                    Ok(())
                }
            }

            Role::Participant => {
                let num_processes = self.config.num_processes;
                if failed != transaction.coordinator(num_processes) {
                    transaction.waiting_on.remove(&failed);
                    transaction
                        .waiting_on
                        .insert(transaction.coordinator(num_processes));
                    return Ok(());
                }

                transaction.up += 1;
                let candidate = transaction.coordinator(num_processes);
                Event::StartElection(StartElectionEvent {
                    timestamp: SystemTime::now(),
                    transaction: transaction.id,
                    failed_coordinator: failed,
                    candidate,
                })
                .publish(&self.event_publisher);

                if candidate == self.me() {
                    transaction.waiting_on.clear();
                    self.become_coordinator(transaction, live)
                } else {
                    transaction.waiting_on = BTreeSet::from([candidate]);
                    self.send(transaction, candidate, ProtocolMessage::YouAreElected);
                    Ok(())
                }
            }
        }
    }

    fn on_you_are_elected(
        &mut self,
        transaction: &mut Transaction,
        live: &BTreeSet<ProcessID>,
    ) -> Result<(), ThreePhaseCommitError> {
        if let Some(decision) = transaction.decision() {
            self.broadcast(transaction, live.iter().copied(), decision_message(decision));
            return Ok(());
        }
        if transaction.role == Role::Coordinator {
            log::debug!(
                "Process {} is already coordinating transaction {}",
                self.me(),
                transaction.id
            );
            return Ok(());
        }
        self.become_coordinator(transaction, live)
    }

    /// Take over as coordinator of `transaction` and start the termination protocol with every process in
    /// `live`.
    fn become_coordinator(
        &mut self,
        transaction: &mut Transaction,
        live: &BTreeSet<ProcessID>,
    ) -> Result<(), ThreePhaseCommitError> {
        let me = self.me();
        let round = transaction.round_of(me, self.config.num_processes);
        if round < transaction.up {
            log::debug!(
                "Process {} ignoring stale election for transaction {}",
                me,
                transaction.id
            );
            return Ok(());
        }
        transaction.up = round;
        transaction.role = Role::Coordinator;
        transaction.votes.clear();
        transaction.acks.clear();

        if transaction.state == State::Aborted {
            if self.decide_abort(transaction)? {
                self.broadcast(transaction, live.iter().copied(), ProtocolMessage::Abort);
            }
            return Ok(());
        }

        let termination_participants: BTreeSet<ProcessID> =
            live.iter().copied().filter(|process| *process != me).collect();
        transaction.termination = Some(Termination::new(termination_participants.clone()));
        transaction.waiting_on = termination_participants.clone();

        Event::BecomeCoordinator(BecomeCoordinatorEvent {
            timestamp: SystemTime::now(),
            transaction: transaction.id,
            termination_participants: termination_participants.iter().copied().collect(),
        })
        .publish(&self.event_publisher);

        self.broadcast(transaction, termination_participants, ProtocolMessage::StateRequest);
        self.finish_termination_if_complete(transaction)
    }

    fn on_recover(
        &mut self,
        transaction: &mut Transaction,
        live: &BTreeSet<ProcessID>,
    ) -> Result<(), ThreePhaseCommitError> {
        if transaction.committed {
            if !self.app.is_applied(transaction.id) {
                self.app.apply(transaction.id, &transaction.payload);
            }
            self.broadcast(transaction, live.iter().copied(), ProtocolMessage::Commit);
        } else if transaction.aborted {
            self.broadcast(transaction, live.iter().copied(), ProtocolMessage::Abort);
        } else if transaction.role == Role::Coordinator && transaction.state == State::Aborted {
            // The coordinator never precommitted, so no process can be committable.
            if self.decide_abort(transaction)? {
                self.broadcast(transaction, live.iter().copied(), ProtocolMessage::Abort);
            }
        } else {
            transaction.recovering = true;
            self.request_decision(transaction);
        }
        Ok(())
    }
}

fn decision_message(decision: Decision) -> MessageConstructor {
    match decision {
        Decision::Commit => ProtocolMessage::Commit,
        Decision::Abort => ProtocolMessage::Abort,
    }
}

/// Enumerates the ways the three-phase commit engine can fail. Both are durable log failures.
#[derive(Debug)]
pub enum ThreePhaseCommitError {
    /// Appending an entry about `transaction` failed. The transaction has been fenced.
    LogAppend {
        transaction: TransactionID,
        source: LogError,
    },

    /// The durable log could not be read back during recovery.
    LogRead(LogError),
}

impl Display for ThreePhaseCommitError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ThreePhaseCommitError::LogAppend {
                transaction,
                source,
            } => write!(
                f,
                "failed to log an entry for transaction {}: {}",
                transaction, source
            ),
            ThreePhaseCommitError::LogRead(source) => {
                write!(f, "failed to recover from the durable log: {}", source)
            }
        }
    }
}

impl std::error::Error for ThreePhaseCommitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ThreePhaseCommitError::LogAppend { source, .. } => Some(source),
            ThreePhaseCommitError::LogRead(source) => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    };

    use super::*;
    use crate::types::data_types::Payload;

    const T: TransactionID = TransactionID::new(7);

    fn p(id: u32) -> ProcessID {
        ProcessID::new(id)
    }

    #[derive(Clone, Default)]
    struct MemLog {
        entries: Arc<Mutex<Vec<ProtocolMessage>>>,
        failing: Arc<AtomicBool>,
    }

    impl MemLog {
        fn kinds(&self) -> Vec<&'static str> {
            self.entries.lock().unwrap().iter().map(|entry| entry.kind()).collect()
        }

        fn fail(&self) {
            self.failing.store(true, Ordering::SeqCst)
        }
    }

    impl DurableLog for MemLog {
        fn append(&mut self, entry: &ProtocolMessage) -> Result<(), LogError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(LogError::Unavailable);
            }
            self.entries.lock().unwrap().push(entry.clone());
            Ok(())
        }

        fn read_all(&self) -> Result<Vec<ProtocolMessage>, LogError> {
            Ok(self.entries.lock().unwrap().clone())
        }
    }

    #[derive(Default)]
    struct RecordingApp {
        applied: Vec<TransactionID>,
    }

    impl App for RecordingApp {
        fn apply(&mut self, transaction: TransactionID, _payload: &Payload) {
            self.applied.push(transaction)
        }

        fn is_applied(&self, transaction: TransactionID) -> bool {
            self.applied.contains(&transaction)
        }
    }

    type Engine = ThreePhaseCommit<MemLog, RecordingApp>;

    fn engine(me: ProcessID, num_processes: u32, log: MemLog, vote_override: VoteOverride) -> Engine {
        ThreePhaseCommit::new(
            ThreePhaseCommitConfiguration { me, num_processes },
            log,
            RecordingApp::default(),
            vote_override,
            None,
        )
    }

    /// A set of engines connected by a lossless FIFO "network" that the test steps through by hand.
    /// Messages to and from dead processes are dropped.
    struct Cluster {
        num_processes: u32,
        engines: Vec<Engine>,
        logs: Vec<MemLog>,
        votes: Vec<VoteOverride>,
        dead: BTreeSet<ProcessID>,
        in_flight: VecDeque<ProtocolMessage>,
        errors: Vec<(ProcessID, ThreePhaseCommitError)>,
    }

    impl Cluster {
        fn new(num_processes: u32) -> Self {
            let logs: Vec<MemLog> = (0..num_processes).map(|_| MemLog::default()).collect();
            let votes: Vec<VoteOverride> = (0..num_processes).map(|_| VoteOverride::new()).collect();
            let engines = ProcessID::all(num_processes)
                .map(|me| {
                    engine(
                        me,
                        num_processes,
                        logs[me.index()].clone(),
                        votes[me.index()].clone(),
                    )
                })
                .collect();
            Self {
                num_processes,
                engines,
                logs,
                votes,
                dead: BTreeSet::new(),
                in_flight: VecDeque::new(),
                errors: Vec::new(),
            }
        }

        fn live_for(&self, me: ProcessID) -> BTreeSet<ProcessID> {
            me.others(self.num_processes)
                .filter(|process| !self.dead.contains(process))
                .collect()
        }

        fn begin(&mut self, coordinator: ProcessID) {
            let begin = ProtocolMessage::BeginProtocol(Envelope::new(
                T,
                coordinator,
                coordinator,
                Payload::new(b"add|Yesterday|example.com/yesterday".to_vec()),
            ));
            self.apply(coordinator, begin);
        }

        fn apply(&mut self, destination: ProcessID, msg: ProtocolMessage) {
            let live = self.live_for(destination);
            if let Err(err) = self.engines[destination.index()].on_receive_msg(msg, &live) {
                self.errors.push((destination, err));
            }
        }

        fn collect(&mut self) {
            for me in ProcessID::all(self.num_processes) {
                let outbox = self.engines[me.index()].drain_outbox();
                if !self.dead.contains(&me) {
                    self.in_flight.extend(outbox);
                }
            }
        }

        /// Deliver the oldest message in flight. Returns false if there was none.
        fn step(&mut self) -> bool {
            self.collect();
            let Some(msg) = self.in_flight.pop_front() else {
                return false;
            };
            let destination = msg.destination();
            if !self.dead.contains(&destination) {
                self.apply(destination, msg);
            }
            true
        }

        fn step_until(&mut self, condition: impl Fn(&Cluster) -> bool) {
            while !condition(&*self) {
                assert!(self.step(), "ran out of messages before the condition held");
            }
        }

        fn deliver_all(&mut self) {
            while self.step() {}
        }

        /// Feed every live engine the timeouts its waiting sets call for. Returns whether any fired.
        fn fire_timeouts(&mut self) -> bool {
            let mut fired = false;
            for me in ProcessID::all(self.num_processes) {
                if self.dead.contains(&me) {
                    continue;
                }
                for timeout in self.engines[me.index()].timeouts(&self.dead) {
                    fired = true;
                    self.apply(me, timeout);
                }
            }
            fired
        }

        fn settle(&mut self) {
            for _ in 0..100 {
                self.deliver_all();
                if !self.fire_timeouts() {
                    return;
                }
            }
            panic!("cluster did not settle");
        }

        fn kill(&mut self, process: ProcessID) {
            self.dead.insert(process);
            self.engines[process.index()].drain_outbox();
        }

        /// Replace `process` with a fresh engine (and a fresh app) that recovers from its durable log.
        fn revive(&mut self, process: ProcessID) {
            self.dead.remove(&process);
            let mut revived = engine(
                process,
                self.num_processes,
                self.logs[process.index()].clone(),
                self.votes[process.index()].clone(),
            );
            revived.recover(&self.live_for(process)).unwrap();
            self.engines[process.index()] = revived;
        }

        fn snapshot(&self, process: ProcessID) -> TransactionSnapshot {
            self.engines[process.index()].transaction(T).unwrap()
        }

        fn state(&self, process: ProcessID) -> State {
            self.snapshot(process).state
        }

        fn decision(&self, process: ProcessID) -> Option<Decision> {
            self.snapshot(process).decision
        }

        fn applied(&self, process: ProcessID) -> &[TransactionID] {
            &self.engines[process.index()].app().applied
        }
    }

    #[test]
    fn all_yes_votes_commit_everywhere() {
        let mut cluster = Cluster::new(3);
        cluster.begin(p(0));
        cluster.settle();

        for process in ProcessID::all(3) {
            assert_eq!(cluster.state(process), State::Committed);
            assert_eq!(cluster.applied(process), &[T]);
            assert!(cluster.snapshot(process).waiting_on.is_empty());
        }
        assert_eq!(cluster.snapshot(p(0)).role, Role::Coordinator);
        assert_eq!(cluster.logs[0].kinds(), ["VoteRequest", "Precommit", "Commit"]);
        assert_eq!(cluster.logs[1].kinds(), ["Yes", "Precommit", "Commit"]);
        assert!(cluster.errors.is_empty());
    }

    #[test]
    fn a_single_no_vote_aborts_everywhere() {
        let mut cluster = Cluster::new(3);
        cluster.votes[2].set(Vote::No);
        cluster.begin(p(0));
        cluster.settle();

        for process in ProcessID::all(3) {
            assert_eq!(cluster.decision(process), Some(Decision::Abort));
            assert!(cluster.applied(process).is_empty());
        }
        assert_eq!(cluster.logs[2].kinds(), ["Abort"]);
        assert_eq!(cluster.logs[1].kinds(), ["Yes", "Abort"]);
    }

    #[test]
    fn a_process_alone_commits_immediately() {
        let mut cluster = Cluster::new(1);
        cluster.begin(p(0));
        assert_eq!(cluster.decision(p(0)), Some(Decision::Commit));
        assert_eq!(cluster.applied(p(0)), &[T]);
        assert!(cluster.engines[0].drain_outbox().is_empty());
    }

    #[test]
    fn silent_participant_counts_as_a_no_vote() {
        let mut cluster = Cluster::new(3);
        cluster.begin(p(0));
        cluster.kill(p(2));
        cluster.settle();

        assert_eq!(cluster.decision(p(0)), Some(Decision::Abort));
        assert_eq!(cluster.decision(p(1)), Some(Decision::Abort));
        assert!(cluster.applied(p(1)).is_empty());
    }

    #[test]
    fn coordinator_commits_without_the_ack_of_a_dead_participant() {
        let mut cluster = Cluster::new(3);
        cluster.begin(p(0));
        cluster.step_until(|cluster| cluster.state(p(0)) == State::Committable);
        cluster.kill(p(1));
        cluster.settle();

        assert_eq!(cluster.decision(p(0)), Some(Decision::Commit));
        assert_eq!(cluster.decision(p(2)), Some(Decision::Commit));
        assert_eq!(cluster.state(p(1)), State::Uncertain);

        // The revived participant only knows it voted Yes, and asks around.
        cluster.revive(p(1));
        assert_eq!(cluster.state(p(1)), State::Uncertain);
        cluster.settle();
        assert_eq!(cluster.decision(p(1)), Some(Decision::Commit));
        assert_eq!(cluster.applied(p(1)), &[T]);
        assert_eq!(cluster.logs[1].kinds(), ["Yes", "Commit"]);
    }

    #[test]
    fn successor_commits_when_the_coordinator_fails_after_precommit() {
        let mut cluster = Cluster::new(3);
        cluster.begin(p(0));
        cluster.step_until(|cluster| {
            cluster.state(p(1)) == State::Committable && cluster.state(p(2)) == State::Committable
        });
        cluster.kill(p(0));
        cluster.settle();

        assert_eq!(cluster.decision(p(1)), Some(Decision::Commit));
        assert_eq!(cluster.decision(p(2)), Some(Decision::Commit));
        assert_eq!(cluster.snapshot(p(1)).role, Role::Coordinator);
        assert_eq!(cluster.snapshot(p(2)).coordinator, p(1));
        assert_eq!(cluster.state(p(0)), State::Committable);
    }

    #[test]
    fn successor_aborts_when_every_survivor_is_uncertain() {
        let mut cluster = Cluster::new(3);
        cluster.begin(p(0));
        cluster.step_until(|cluster| {
            cluster.state(p(1)) == State::Uncertain && cluster.state(p(2)) == State::Uncertain
        });
        cluster.kill(p(0));
        cluster.settle();

        assert_eq!(cluster.decision(p(1)), Some(Decision::Abort));
        assert_eq!(cluster.decision(p(2)), Some(Decision::Abort));

        // The old coordinator never precommitted, so it aborts on recovery too.
        cluster.revive(p(0));
        cluster.settle();
        assert_eq!(cluster.decision(p(0)), Some(Decision::Abort));
        assert_eq!(cluster.logs[0].kinds(), ["VoteRequest", "Abort"]);
    }

    #[test]
    fn election_skips_a_dead_candidate() {
        let mut cluster = Cluster::new(4);
        cluster.begin(p(0));
        cluster.step_until(|cluster| {
            (1..4).all(|id| cluster.state(p(id)) == State::Uncertain)
        });
        cluster.kill(p(0));
        cluster.kill(p(1));
        cluster.settle();

        assert_eq!(cluster.snapshot(p(2)).role, Role::Coordinator);
        assert_eq!(cluster.decision(p(2)), Some(Decision::Abort));
        assert_eq!(cluster.decision(p(3)), Some(Decision::Abort));
    }

    #[test]
    fn recovered_coordinator_rebroadcasts_its_commit() {
        let mut cluster = Cluster::new(3);
        cluster.begin(p(0));
        cluster.step_until(|cluster| cluster.decision(p(0)) == Some(Decision::Commit));
        // Crash before the Commits leave.
        cluster.kill(p(0));
        assert_eq!(cluster.state(p(1)), State::Committable);

        cluster.revive(p(0));
        cluster.deliver_all();

        for process in ProcessID::all(3) {
            assert_eq!(cluster.decision(process), Some(Decision::Commit));
            assert_eq!(cluster.applied(process), &[T]);
        }
        assert_eq!(cluster.logs[0].kinds(), ["VoteRequest", "Precommit", "Commit"]);
    }

    #[test]
    fn repeated_commit_has_no_effect() {
        let mut cluster = Cluster::new(3);
        cluster.begin(p(0));
        cluster.settle();
        let log_len = cluster.logs[1].kinds().len();

        let payload = cluster.snapshot(p(1)).payload;
        cluster.apply(p(1), ProtocolMessage::Commit(Envelope::new(T, p(0), p(1), payload.clone())));
        cluster.apply(p(1), ProtocolMessage::Abort(Envelope::new(T, p(2), p(1), payload)));

        assert_eq!(cluster.logs[1].kinds().len(), log_len);
        assert_eq!(cluster.applied(p(1)), &[T]);
        assert_eq!(cluster.decision(p(1)), Some(Decision::Commit));
        assert!(cluster.engines[1].drain_outbox().is_empty());
    }

    #[test]
    fn unvoted_process_aborts_on_state_request() {
        let mut participant = engine(p(1), 3, MemLog::default(), VoteOverride::new());
        let state_request =
            ProtocolMessage::StateRequest(Envelope::new(T, p(2), p(1), Payload::empty()));
        participant.on_receive_msg(state_request, &BTreeSet::from([p(0), p(2)])).unwrap();

        assert_eq!(
            participant.drain_outbox(),
            vec![ProtocolMessage::Abort(Envelope::new(T, p(1), p(2), Payload::empty()))]
        );
        assert_eq!(
            participant.transaction(T).unwrap().decision,
            Some(Decision::Abort)
        );
    }

    #[test]
    fn undecided_process_ignores_decision_requests() {
        let mut participant = engine(p(1), 3, MemLog::default(), VoteOverride::new());
        let live = BTreeSet::from([p(0), p(2)]);
        let vote_request = ProtocolMessage::vote_request(
            Envelope::new(T, p(0), p(1), Payload::empty()),
            vec![p(1), p(2)],
        );
        participant.on_receive_msg(vote_request, &live).unwrap();
        let decision_request =
            ProtocolMessage::DecisionRequest(Envelope::new(T, p(2), p(1), Payload::empty()));
        participant.on_receive_msg(decision_request, &live).unwrap();

        let outbox = participant.drain_outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].kind(), "Yes");
    }

    #[test]
    fn failed_append_fences_the_transaction() {
        let mut cluster = Cluster::new(3);
        cluster.logs[1].fail();
        cluster.begin(p(0));
        cluster.settle();

        assert!(matches!(
            cluster.errors.as_slice(),
            [(process, ThreePhaseCommitError::LogAppend { transaction, .. })]
                if *process == p(1) && *transaction == T
        ));
        let fenced = cluster.snapshot(p(1));
        assert!(fenced.fenced);
        assert_eq!(fenced.state, State::Aborted);

        // The coordinator never got a vote from process 1.
        assert_eq!(cluster.snapshot(p(0)).waiting_on, BTreeSet::from([p(1)]));
        assert_eq!(cluster.decision(p(0)), None);
    }

    #[test]
    fn updated_snapshots_are_reported_once() {
        let mut cluster = Cluster::new(3);
        cluster.begin(p(0));
        let updated = cluster.engines[0].take_updated_snapshots();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].role, Role::Coordinator);
        assert!(cluster.engines[0].take_updated_snapshots().is_empty());
    }
}
