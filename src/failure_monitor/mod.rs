/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Keep-alive based failure detection.
//!
//! Every process periodically sends a [`KeepAlive`](messages::KeepAlive) to every other process, and
//! considers a process dead once it has not heard from it for longer than a configured timeout. Detection
//! is purely timeout based. The timeout must be strictly greater than the keep-alive interval (in practice,
//! several times greater) so that scheduling jitter does not cause false positives.
//!
//! The monitor never reads from the network: the process's main loop hands it the keep-alives it received
//! since the previous iteration. Its output, the set of dead processes, drives the
//! [engine's](crate::three_phase_commit) timeouts.

pub mod messages;

pub(crate) mod implementation;

pub use implementation::FailureMonitorConfiguration;
