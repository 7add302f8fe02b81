/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Messages exchanged by the failure monitor.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::data_types::ProcessID;

/// Heartbeat periodically sent to every other process to show that the sender is alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct KeepAlive {
    pub sender: ProcessID,
    pub destination: ProcessID,
}
