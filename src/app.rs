/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait definition for the business application that committed transactions are applied to.
//!
//! The three-phase commit engine never looks inside a transaction's [`Payload`]. Once a transaction is
//! decided COMMIT at this process, the engine hands its payload to the library user's `App`, and that is
//! the only place the payload gets interpreted.
//!
//! ## Exactly-once application
//!
//! The engine calls [`App::apply`] at most once per transaction ID over the lifetime of the app, including
//! across crash and recovery. To make this possible, the app must remember which transactions it has
//! applied and report them through [`App::is_applied`]. An app that keeps its state in memory only and is
//! recreated on restart will simply see recovered COMMITs applied again, which is what it wants.

use crate::types::data_types::{Payload, TransactionID};

pub trait App: Send + 'static {
    /// Apply the payload of `transaction`, which has just been decided COMMIT.
    fn apply(&mut self, transaction: TransactionID, payload: &Payload);

    /// Check whether `transaction` has already been applied.
    fn is_applied(&self, transaction: TransactionID) -> bool;
}
