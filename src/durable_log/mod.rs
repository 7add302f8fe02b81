/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Append-only, crash-durable record of the protocol messages a process has logged about itself.
//!
//! The [engine](crate::three_phase_commit) appends an entry for every step that could affect a safety
//! property (a Yes vote, a Precommit, a COMMIT or ABORT decision, and the start of a transaction it
//! coordinates) and only then enqueues the messages that announce the step. A process that crashes after
//! sending but before logging would be unable to honor what it told others; logging first rules this out.
//!
//! On startup the whole log is [read back](pluggables::DurableLog::read_all) and replayed to rebuild the
//! transaction table (see [`recovery`](crate::three_phase_commit::recovery)).
//!
//! The log is pluggable: library users may supply any implementation of [`DurableLog`](pluggables::DurableLog).
//! [`FileLog`](file_log::FileLog) is the implementation provided by this crate.

pub mod pluggables;

pub mod file_log;
