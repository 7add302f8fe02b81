/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Exhaustive enumeration of every message variant that crosses the network.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    failure_monitor::messages::KeepAlive, three_phase_commit::messages::ProtocolMessage,
    types::data_types::ProcessID,
};

/// All message variants sent between processes.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Message {
    /// See: [`ProtocolMessage`].
    Protocol(ProtocolMessage),

    /// See: [`KeepAlive`].
    KeepAlive(KeepAlive),
}

impl Message {
    /// Get the process that sent this message.
    pub fn sender(&self) -> ProcessID {
        match self {
            Message::Protocol(msg) => msg.sender(),
            Message::KeepAlive(keep_alive) => keep_alive.sender,
        }
    }

    /// Get the process this message is addressed to.
    pub fn destination(&self) -> ProcessID {
        match self {
            Message::Protocol(msg) => msg.destination(),
            Message::KeepAlive(keep_alive) => keep_alive.destination,
        }
    }
}

impl From<ProtocolMessage> for Message {
    fn from(value: ProtocolMessage) -> Self {
        Message::Protocol(value)
    }
}

impl From<KeepAlive> for Message {
    fn from(value: KeepAlive) -> Self {
        Message::KeepAlive(value)
    }
}
