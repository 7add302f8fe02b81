/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The thread that receives [events](crate::events) from the process's main loop and fires the handlers
//! registered for them.

use std::{
    sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError},
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{events::*, logging::Logger};

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// How long the event bus waits for an event before checking its shutdown signal again.
const POLL_PERIOD: Duration = Duration::from_millis(10);

pub(crate) struct EventHandlers {
    pub(crate) begin_transaction_handlers: Vec<HandlerPtr<BeginTransactionEvent>>,
    pub(crate) vote_handlers: Vec<HandlerPtr<VoteEvent>>,
    pub(crate) precommit_handlers: Vec<HandlerPtr<PrecommitEvent>>,
    pub(crate) commit_handlers: Vec<HandlerPtr<CommitEvent>>,
    pub(crate) abort_handlers: Vec<HandlerPtr<AbortEvent>>,
    pub(crate) recover_transaction_handlers: Vec<HandlerPtr<RecoverTransactionEvent>>,
    pub(crate) receive_message_handlers: Vec<HandlerPtr<ReceiveMessageEvent>>,
    pub(crate) start_election_handlers: Vec<HandlerPtr<StartElectionEvent>>,
    pub(crate) become_coordinator_handlers: Vec<HandlerPtr<BecomeCoordinatorEvent>>,
    pub(crate) process_dead_handlers: Vec<HandlerPtr<ProcessDeadEvent>>,
    pub(crate) process_live_handlers: Vec<HandlerPtr<ProcessLiveEvent>>,
}

/// Put the default logger for `T` (if `log_events` is set) and the user-defined handler for `T` (if any)
/// into one vector.
fn handlers<T: Logger>(log_events: bool, user_handler: Option<HandlerPtr<T>>) -> Vec<HandlerPtr<T>> {
    let mut handlers = Vec::new();
    if log_events {
        handlers.push(T::get_logger());
    }
    handlers.extend(user_handler);
    handlers
}

impl EventHandlers {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        log_events: bool,
        begin_transaction_handler: Option<HandlerPtr<BeginTransactionEvent>>,
        receive_message_handler: Option<HandlerPtr<ReceiveMessageEvent>>,
        vote_handler: Option<HandlerPtr<VoteEvent>>,
        precommit_handler: Option<HandlerPtr<PrecommitEvent>>,
        commit_handler: Option<HandlerPtr<CommitEvent>>,
        abort_handler: Option<HandlerPtr<AbortEvent>>,
        start_election_handler: Option<HandlerPtr<StartElectionEvent>>,
        become_coordinator_handler: Option<HandlerPtr<BecomeCoordinatorEvent>>,
        process_dead_handler: Option<HandlerPtr<ProcessDeadEvent>>,
        process_live_handler: Option<HandlerPtr<ProcessLiveEvent>>,
        recover_transaction_handler: Option<HandlerPtr<RecoverTransactionEvent>>,
    ) -> Self {
        Self {
            begin_transaction_handlers: handlers(log_events, begin_transaction_handler),
            vote_handlers: handlers(log_events, vote_handler),
            precommit_handlers: handlers(log_events, precommit_handler),
            commit_handlers: handlers(log_events, commit_handler),
            abort_handlers: handlers(log_events, abort_handler),
            recover_transaction_handlers: handlers(log_events, recover_transaction_handler),
            receive_message_handlers: handlers(log_events, receive_message_handler),
            start_election_handlers: handlers(log_events, start_election_handler),
            become_coordinator_handlers: handlers(log_events, become_coordinator_handler),
            process_dead_handlers: handlers(log_events, process_dead_handler),
            process_live_handlers: handlers(log_events, process_live_handler),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.begin_transaction_handlers.is_empty()
            && self.vote_handlers.is_empty()
            && self.precommit_handlers.is_empty()
            && self.commit_handlers.is_empty()
            && self.abort_handlers.is_empty()
            && self.recover_transaction_handlers.is_empty()
            && self.receive_message_handlers.is_empty()
            && self.start_election_handlers.is_empty()
            && self.become_coordinator_handlers.is_empty()
            && self.process_dead_handlers.is_empty()
            && self.process_live_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::BeginTransaction(begin_transaction_event) => self
                .begin_transaction_handlers
                .iter()
                .for_each(|handler| handler(&begin_transaction_event)),

            Event::Vote(vote_event) => self
                .vote_handlers
                .iter()
                .for_each(|handler| handler(&vote_event)),

            Event::Precommit(precommit_event) => self
                .precommit_handlers
                .iter()
                .for_each(|handler| handler(&precommit_event)),

            Event::Commit(commit_event) => self
                .commit_handlers
                .iter()
                .for_each(|handler| handler(&commit_event)),

            Event::Abort(abort_event) => self
                .abort_handlers
                .iter()
                .for_each(|handler| handler(&abort_event)),

            Event::RecoverTransaction(recover_transaction_event) => self
                .recover_transaction_handlers
                .iter()
                .for_each(|handler| handler(&recover_transaction_event)),

            Event::ReceiveMessage(receive_message_event) => self
                .receive_message_handlers
                .iter()
                .for_each(|handler| handler(&receive_message_event)),

            Event::StartElection(start_election_event) => self
                .start_election_handlers
                .iter()
                .for_each(|handler| handler(&start_election_event)),

            Event::BecomeCoordinator(become_coordinator_event) => self
                .become_coordinator_handlers
                .iter()
                .for_each(|handler| handler(&become_coordinator_event)),

            Event::ProcessDead(process_dead_event) => self
                .process_dead_handlers
                .iter()
                .for_each(|handler| handler(&process_dead_event)),

            Event::ProcessLive(process_live_event) => self
                .process_live_handlers
                .iter()
                .for_each(|handler| handler(&process_live_event)),
        }
    }
}

/// Start the event bus thread, which fires `event_handlers` for every event received from
/// `event_subscriber` until `shutdown_signal` is received or every publisher has been dropped.
pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => {
                // Events published before shutdown still get handled.
                event_subscriber
                    .try_iter()
                    .for_each(|event| event_handlers.fire_handlers(event));
                return;
            }
            Err(TryRecvError::Empty) => (),
        }

        match event_subscriber.recv_timeout(POLL_PERIOD) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}
