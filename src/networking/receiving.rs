/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions and types for receiving messages from the P2P network.

use std::collections::VecDeque;

use crate::{
    failure_monitor::messages::KeepAlive, three_phase_commit::messages::ProtocolMessage,
    types::data_types::ProcessID,
};

use super::{messages::Message, network::Network};

/// Receiving end of the network for a process's main loop.
///
/// Every loop iteration, [`receive_all`](Self::receive_all) drains the [`Network`] and sorts what it
/// received into two buffers: keep-alives, which are handed to the
/// [failure monitor](crate::failure_monitor) on every iteration, and protocol messages, which wait in
/// arrival order until the [engine](crate::three_phase_commit) is allowed to process them. Keeping the two
/// apart lets liveness monitoring continue while protocol progress is halted by a test hook.
pub(crate) struct ReceiverHandle<N: Network> {
    me: ProcessID,
    network: N,
    keep_alives: Vec<KeepAlive>,
    protocol_msgs: VecDeque<ProtocolMessage>,
}

impl<N: Network> ReceiverHandle<N> {
    pub(crate) fn new(me: ProcessID, network: N) -> Self {
        Self {
            me,
            network,
            keep_alives: Vec::new(),
            protocol_msgs: VecDeque::new(),
        }
    }

    /// Drain every message currently available from the network into the internal buffers.
    ///
    /// Messages addressed to another process, and local-only protocol events (which a peer has no
    /// business sending), are dropped.
    pub(crate) fn receive_all(&mut self) {
        while let Some(msg) = self.network.recv() {
            if msg.destination() != self.me {
                log::debug!(
                    "Process {} dropping a message addressed to process {}",
                    self.me,
                    msg.destination()
                );
                continue;
            }
            match msg {
                Message::KeepAlive(keep_alive) => self.keep_alives.push(keep_alive),
                Message::Protocol(p_msg) if p_msg.is_local() => {
                    log::warn!(
                        "Process {} dropping local-only message received over the network: {}",
                        self.me,
                        p_msg
                    );
                }
                Message::Protocol(p_msg) => self.protocol_msgs.push_back(p_msg),
            }
        }
    }

    /// Take every keep-alive received since the last call.
    pub(crate) fn take_keep_alives(&mut self) -> Vec<KeepAlive> {
        std::mem::take(&mut self.keep_alives)
    }

    /// Take every buffered protocol message, oldest first.
    pub(crate) fn take_protocol_msgs(&mut self) -> VecDeque<ProtocolMessage> {
        std::mem::take(&mut self.protocol_msgs)
    }
}
