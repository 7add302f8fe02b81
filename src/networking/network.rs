/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use crate::types::data_types::ProcessID;

use super::messages::Message;

pub trait Network: Clone + Send {
    /// Send a message to the specified process without blocking.
    fn send(&mut self, peer: ProcessID, message: Message);

    /// Receive a message from any process. Returns immediately with a None if no message is available now.
    fn recv(&mut self) -> Option<Message>;
}
