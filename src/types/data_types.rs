/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to identify things or store bytes, and do not have any major "active" behavior.

use std::fmt::{self, Debug, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

/// Index of a process in the process set.
///
/// Processes are numbered `0..N`, where `N` is the
/// [`num_processes`](crate::process::Configuration::num_processes) every process is configured with.
/// The index doubles as the process's network address: [`Network::send`](crate::networking::network::Network::send)
/// takes a `ProcessID`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct ProcessID(u32);

impl ProcessID {
    /// Create a new `ProcessID` with an `int` value.
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    /// Get the `u32` value of this `ProcessID`.
    pub const fn int(&self) -> u32 {
        self.0
    }

    /// Get the value of this `ProcessID` as an index into a per-process table.
    pub const fn index(&self) -> usize {
        self.0 as usize
    }

    /// Iterate through every `ProcessID` in a process set of size `num_processes`.
    pub fn all(num_processes: u32) -> impl Iterator<Item = ProcessID> {
        (0..num_processes).map(ProcessID)
    }

    /// Iterate through every `ProcessID` in a process set of size `num_processes`, except `self`.
    pub fn others(self, num_processes: u32) -> impl Iterator<Item = ProcessID> {
        Self::all(num_processes).filter(move |process| *process != self)
    }
}

impl Display for ProcessID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for ProcessID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Number that uniquely identifies one instance of the three-phase commit protocol.
///
/// Transaction IDs are chosen by whoever initiates the transaction (see
/// [`Process::begin_transaction`](crate::process::Process::begin_transaction)) and must be globally unique.
/// Every message exchanged on behalf of a transaction carries its ID.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct TransactionID(u64);

impl TransactionID {
    /// Create a new `TransactionID` with an `int` value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the `u64` value of this `TransactionID`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for TransactionID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for TransactionID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// The business action a transaction commits.
///
/// The three-phase commit engine treats a `Payload` as an opaque sequence of bytes: it is persisted and
/// echoed in every message of its transaction, and handed to [`App::apply`](crate::app::App::apply) once the
/// transaction commits, but never interpreted.
#[derive(Clone, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Payload(Vec<u8>);

impl Payload {
    /// Create a new `Payload` wrapping around `bytes`.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Create an empty `Payload`.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Get a reference to the inner bytes of this `Payload`.
    pub fn bytes(&self) -> &Vec<u8> {
        &self.0
    }

    /// Consume this `Payload`, returning its inner bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Get the number of bytes in this `Payload`.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check whether this `Payload` contains no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Debug for Payload {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::new(value)
    }
}
