/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Implementation of the failure monitor.
//!
//! Main type: [`FailureMonitor`].

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::mpsc::Sender,
    time::{Duration, Instant, SystemTime},
};

use crate::{
    events::{Event, ProcessDeadEvent, ProcessLiveEvent},
    networking::{network::Network, sending::SenderHandle},
    types::data_types::ProcessID,
};

use super::messages::KeepAlive;

/// Parameters of the failure monitor.
#[derive(Clone, Debug)]
pub struct FailureMonitorConfiguration {
    pub me: ProcessID,
    pub num_processes: u32,

    /// Keep-alives are sent to each process no more often than once every `interval`.
    pub interval: Duration,

    /// A process is considered dead if no keep-alive has been received from it in more than `timeout`.
    pub timeout: Duration,
}

impl FailureMonitorConfiguration {
    /// Check whether `timeout` is strictly greater than `interval`.
    pub fn is_valid(&self) -> bool {
        self.timeout > self.interval
    }
}

/// What this process currently believes about another process.
#[derive(Clone, Copy, Debug)]
struct ProcessStatus {
    live: bool,
    last_received: Instant,
    last_sent: Option<Instant>,
}

/// Liveness table of every other process, from this process's point of view.
///
/// # Usage
///
/// The caller should call [`monitor`](Self::monitor) once per iteration of its main loop, with every
/// keep-alive received since the previous call. The queries [`live`](Self::live), [`dead`](Self::dead), and
/// [`never_failed`](Self::never_failed) reflect the table as of the latest call.
///
/// # Optimism
///
/// Every process starts out live, as if a keep-alive had been received from it when the monitor was
/// created. Liveness is not sticky in either direction: a dead process that sends a keep-alive is live
/// again. The [never-failed](Self::never_failed) set is the exception. A process removed from it is never
/// re-added.
pub(crate) struct FailureMonitor<N: Network> {
    config: FailureMonitorConfiguration,
    statuses: BTreeMap<ProcessID, ProcessStatus>,
    never_failed: BTreeSet<ProcessID>,
    sender: SenderHandle<N>,
    event_publisher: Option<Sender<Event>>,
}

impl<N: Network> FailureMonitor<N> {
    pub(crate) fn new(
        config: FailureMonitorConfiguration,
        sender: SenderHandle<N>,
        now: Instant,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        let statuses: BTreeMap<ProcessID, ProcessStatus> = config
            .me
            .others(config.num_processes)
            .map(|process| {
                (
                    process,
                    ProcessStatus {
                        live: true,
                        last_received: now,
                        last_sent: None,
                    },
                )
            })
            .collect();
        let never_failed = statuses.keys().copied().collect();

        Self {
            config,
            statuses,
            never_failed,
            sender,
            event_publisher,
        }
    }

    /// Update the liveness table with `keep_alives` and the passage of time up to `now`, send keep-alives
    /// that are due, and return the processes that are currently dead.
    pub(crate) fn monitor(
        &mut self,
        keep_alives: Vec<KeepAlive>,
        now: Instant,
    ) -> BTreeSet<ProcessID> {
        // 1. Mark the senders of received keep-alives as live.
        for keep_alive in keep_alives {
            let Some(status) = self.statuses.get_mut(&keep_alive.sender) else {
                continue;
            };
            status.last_received = now;
            if !status.live {
                status.live = true;
                log::debug!("Process {} sees process {} live", self.config.me, keep_alive.sender);
                Event::ProcessLive(ProcessLiveEvent {
                    timestamp: SystemTime::now(),
                    process: keep_alive.sender,
                })
                .publish(&self.event_publisher);
            }
        }

        for (process, status) in self.statuses.iter_mut() {
            // 2. Send a keep-alive if one is due.
            let due = match status.last_sent {
                None => true,
                Some(last_sent) => now.saturating_duration_since(last_sent) >= self.config.interval,
            };
            if due {
                self.sender.send(
                    *process,
                    KeepAlive {
                        sender: self.config.me,
                        destination: *process,
                    },
                );
                status.last_sent = Some(now);
            }

            // 3. Mark silent processes dead.
            if status.live
                && now.saturating_duration_since(status.last_received) > self.config.timeout
            {
                status.live = false;
                self.never_failed.remove(process);
                log::debug!("Process {} sees process {} dead", self.config.me, process);
                Event::ProcessDead(ProcessDeadEvent {
                    timestamp: SystemTime::now(),
                    process: *process,
                })
                .publish(&self.event_publisher);
            }
        }

        // 4. Report.
        self.dead()
    }

    /// Every other process currently considered live.
    pub(crate) fn live(&self) -> BTreeSet<ProcessID> {
        self.statuses
            .iter()
            .filter(|(_, status)| status.live)
            .map(|(process, _)| *process)
            .collect()
    }

    /// Every other process currently considered dead.
    pub(crate) fn dead(&self) -> BTreeSet<ProcessID> {
        self.statuses
            .iter()
            .filter(|(_, status)| !status.live)
            .map(|(process, _)| *process)
            .collect()
    }

    /// Every other process that has never been considered dead.
    pub(crate) fn never_failed(&self) -> &BTreeSet<ProcessID> {
        &self.never_failed
    }
}
