/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A Rust implementation of Three-Phase Commit (3PC) with a non-blocking termination protocol.
//!
//! A fixed set of processes agree, for every transaction, on whether to COMMIT or ABORT it. A transaction
//! commits only if every process voted Yes, and no two processes that decide ever decide differently,
//! even if the coordinator crashes midway. Committed transactions are applied to the library user's
//! [App](app::App).
//!
//! The crate is organized by sub-protocol:
//! - [three_phase_commit]: the per-transaction state machine, termination protocol, and recovery.
//! - [failure_monitor]: keep-alive based detection of crashed processes.
//! - [durable_log]: the crash-durable record that recovery replays.
//! - [networking]: the pluggable transport and the wire message type.
//!
//! To run a process, see [process].

pub mod app;

pub mod durable_log;

pub(crate) mod event_bus;

pub mod events;

pub mod failure_monitor;

pub mod logging;

pub mod networking;

pub mod process;

pub(crate) mod runtime;

pub mod three_phase_commit;

pub mod types;
