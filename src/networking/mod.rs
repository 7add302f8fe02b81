/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable peer-to-peer networking.
//!
//! Processes are reachable by their [`ProcessID`](crate::types::data_types::ProcessID). Networking
//! providers interact with a process's main loop through implementations of the [`Network`](network::Network)
//! trait. The transport is not required to preserve ordering across destinations, or to deliver every
//! message: the protocol tolerates loss, and duplicate delivery does not corrupt its state.

pub mod network;

pub mod messages;

pub(crate) mod receiving;

pub(crate) mod sending;
