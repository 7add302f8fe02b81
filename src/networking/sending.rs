/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions and types for sending messages to the P2P network.

use std::collections::VecDeque;

use crate::{three_phase_commit::messages::ProtocolMessage, types::data_types::ProcessID};

use super::{messages::Message, network::Network};

/// Handle for sending messages to the [`Network`].
///
/// It can be used to send instances of any type that implement the [`Into<Message>`] trait.
#[derive(Clone)]
pub(crate) struct SenderHandle<N: Network> {
    network: N,
}

impl<N: Network> SenderHandle<N> {
    pub(crate) fn new(network: N) -> Self {
        Self { network }
    }

    pub(crate) fn send<S: Into<Message>>(&mut self, peer: ProcessID, msg: S) {
        self.network.send(peer, msg.into())
    }
}

/// Counter of sent protocol messages, with an optional threshold after which sending stops.
///
/// This is the state behind the [`halt_after_messages`](crate::process::Process::halt_after_messages) and
/// [`resume_sending`](crate::process::Process::resume_sending) test hooks. It is shared between the
/// process's main loop and the [`Process`](crate::process::Process) handle behind a mutex.
#[derive(Debug, Default)]
pub(crate) struct Throttle {
    sent: u64,
    halt_at: Option<u64>,
    halted: bool,
}

impl Throttle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Stop sending once `n` more protocol messages have been sent.
    pub(crate) fn halt_after(&mut self, n: u64) {
        self.halt_at = Some(self.sent + n);
    }

    /// Lift any threshold and un-halt.
    pub(crate) fn resume(&mut self) {
        self.halt_at = None;
        self.halted = false;
    }

    /// Whether a threshold has been reached while messages were waiting to be sent.
    pub(crate) fn is_halted(&self) -> bool {
        self.halted
    }

    /// Total number of protocol messages sent so far.
    pub(crate) fn sent(&self) -> u64 {
        self.sent
    }

    /// Check whether one more message may be sent. Marks the throttle halted if not.
    fn permits_one(&mut self) -> bool {
        match self.halt_at {
            Some(halt_at) if self.sent >= halt_at => {
                self.halted = true;
                false
            }
            _ => true,
        }
    }
}

/// Strictly FIFO queue of protocol messages waiting to be sent.
///
/// The engine only ever enqueues; messages leave the queue in [`flush`](Self::flush), one at a time and in
/// order, for as long as the [`Throttle`] permits. A message held back by the throttle stays at the
/// front of the queue, so after a resume the next message sent is exactly the next one enqueued.
pub(crate) struct OutboundQueue {
    queue: VecDeque<ProtocolMessage>,
}

impl OutboundQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    pub(crate) fn extend(&mut self, msgs: impl IntoIterator<Item = ProtocolMessage>) {
        self.queue.extend(msgs)
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    /// Send queued messages in order until the queue is empty or the throttle stops us. Returns the
    /// number of messages sent.
    pub(crate) fn flush<N: Network>(
        &mut self,
        sender: &mut SenderHandle<N>,
        throttle: &mut Throttle,
    ) -> usize {
        let mut sent = 0;
        while !self.queue.is_empty() {
            if !throttle.permits_one() {
                break;
            }
            if let Some(msg) = self.queue.pop_front() {
                sender.send(msg.destination(), msg);
                throttle.sent += 1;
                sent += 1;
            }
        }
        sent
    }
}
