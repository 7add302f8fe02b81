/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The main loop of a process.
//!
//! The main loop thread is the only thread that touches the [engine](crate::three_phase_commit) and the
//! [failure monitor](crate::failure_monitor). Every tick it:
//! 1. Drains the network, sorting keep-alives from protocol messages.
//! 2. Runs the failure monitor, which also sends keep-alives that are due.
//! 3. Unless sending is halted by a test hook:
//!     * Begins the transactions requested through [`Process::begin_transaction`](crate::process::Process::begin_transaction).
//!     * Applies received protocol messages to the engine, in arrival order.
//!     * Applies the `Timeout`s the failure monitor's dead set calls for.
//!     * Re-sends decision requests for recovered transactions, if due.
//! 4. Flushes the engine's outbox through the throttle.
//! 5. Publishes snapshots of the transactions touched in this tick.
//!
//! It then sleeps for the configured tick period.
//!
//! A durable log error stops the main loop for good: the process is then considered to have failed, and
//! other processes will see it as dead.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, TryRecvError},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    app::App,
    durable_log::pluggables::DurableLog,
    failure_monitor::implementation::FailureMonitor,
    networking::{
        network::Network,
        receiving::ReceiverHandle,
        sending::{OutboundQueue, SenderHandle, Throttle},
    },
    three_phase_commit::{
        implementation::{ThreePhaseCommit, ThreePhaseCommitError},
        messages::{Envelope, ProtocolMessage},
        types::TransactionSnapshot,
    },
    types::data_types::{Payload, ProcessID, TransactionID},
};

/// Lock `mutex`, ignoring poisoning. None of the shared state can be left inconsistent by a panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The failure monitor's view of the other processes, as of the latest tick.
#[derive(Clone, Debug, Default)]
pub(crate) struct Liveness {
    pub(crate) live: BTreeSet<ProcessID>,
    pub(crate) never_failed: BTreeSet<ProcessID>,
}

/// State shared between the main loop and the [`Process`](crate::process::Process) handle.
#[derive(Clone)]
pub(crate) struct SharedState {
    pub(crate) begin_requests: Arc<Mutex<VecDeque<(TransactionID, Payload)>>>,
    pub(crate) throttle: Arc<Mutex<Throttle>>,
    pub(crate) snapshots: Arc<Mutex<BTreeMap<TransactionID, TransactionSnapshot>>>,
    pub(crate) liveness: Arc<Mutex<Liveness>>,
    pub(crate) failed: Arc<AtomicBool>,
}

impl SharedState {
    pub(crate) fn new() -> Self {
        Self {
            begin_requests: Arc::new(Mutex::new(VecDeque::new())),
            throttle: Arc::new(Mutex::new(Throttle::new())),
            snapshots: Arc::new(Mutex::new(BTreeMap::new())),
            liveness: Arc::new(Mutex::new(Liveness::default())),
            failed: Arc::new(AtomicBool::new(false)),
        }
    }
}

pub(crate) struct RuntimeConfiguration {
    pub(crate) me: ProcessID,
    pub(crate) tick_period: Duration,
    pub(crate) decision_request_interval: Duration,
}

pub(crate) struct Runtime<N: Network, L: DurableLog, A: App> {
    config: RuntimeConfiguration,
    receiver: ReceiverHandle<N>,
    sender: SenderHandle<N>,
    outbound: OutboundQueue,
    failure_monitor: FailureMonitor<N>,
    engine: ThreePhaseCommit<L, A>,
    shared: SharedState,
    next_decision_request: Instant,
    shutdown_signal: Receiver<()>,
}

impl<N: Network + 'static, L: DurableLog, A: App> Runtime<N, L, A> {
    pub(crate) fn new(
        config: RuntimeConfiguration,
        network: N,
        failure_monitor: FailureMonitor<N>,
        engine: ThreePhaseCommit<L, A>,
        shared: SharedState,
        shutdown_signal: Receiver<()>,
    ) -> Self {
        let next_decision_request = Instant::now() + config.decision_request_interval;
        Self {
            receiver: ReceiverHandle::new(config.me, network.clone()),
            sender: SenderHandle::new(network),
            outbound: OutboundQueue::new(),
            failure_monitor,
            engine,
            shared,
            next_decision_request,
            shutdown_signal,
            config,
        }
    }

    pub(crate) fn start(mut self) -> JoinHandle<()> {
        thread::spawn(move || loop {
            match self.shutdown_signal.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => return,
                Err(TryRecvError::Empty) => (),
            }

            if let Err(err) = self.tick() {
                log::error!("Process {} halting: {}", self.config.me, err);
                self.shared.failed.store(true, Ordering::SeqCst);
                return;
            }

            thread::sleep(self.config.tick_period);
        })
    }

    fn tick(&mut self) -> Result<(), ThreePhaseCommitError> {
        let now = Instant::now();

        // 1. Drain the network.
        self.receiver.receive_all();

        // 2. Monitor liveness.
        let keep_alives = self.receiver.take_keep_alives();
        let dead = self.failure_monitor.monitor(keep_alives, now);
        let live = self.failure_monitor.live();
        *lock(&self.shared.liveness) = Liveness {
            live: live.clone(),
            never_failed: self.failure_monitor.never_failed().clone(),
        };

        // 3. Make protocol progress, unless halted.
        let halted = lock(&self.shared.throttle).is_halted();
        let result = if halted {
            Ok(())
        } else {
            self.make_progress(&live, &dead, now)
        };

        // 4. Flush the outbox, including anything enqueued before a failure.
        self.outbound.extend(self.engine.drain_outbox());
        let sent = self
            .outbound
            .flush(&mut self.sender, &mut lock(&self.shared.throttle));
        if sent > 0 || self.outbound.len() > 0 {
            log::debug!(
                "Process {} sent {} protocol messages, {} pending",
                self.config.me,
                sent,
                self.outbound.len()
            );
        }

        // 5. Publish snapshots.
        let updated = self.engine.take_updated_snapshots();
        if !updated.is_empty() {
            lock(&self.shared.snapshots)
                .extend(updated.into_iter().map(|snapshot| (snapshot.id, snapshot)));
        }

        result
    }

    fn make_progress(
        &mut self,
        live: &BTreeSet<ProcessID>,
        dead: &BTreeSet<ProcessID>,
        now: Instant,
    ) -> Result<(), ThreePhaseCommitError> {
        let me = self.config.me;

        let begin_requests: Vec<(TransactionID, Payload)> =
            lock(&self.shared.begin_requests).drain(..).collect();
        for (transaction, payload) in begin_requests {
            let begin = ProtocolMessage::BeginProtocol(Envelope::new(transaction, me, me, payload));
            self.engine.on_receive_msg(begin, live)?;
        }

        for msg in self.receiver.take_protocol_msgs() {
            self.engine.on_receive_msg(msg, live)?;
        }

        for timeout in self.engine.timeouts(dead) {
            self.engine.on_receive_msg(timeout, live)?;
        }

        if now >= self.next_decision_request {
            self.engine.retry_decision_requests();
            self.next_decision_request = now + self.config.decision_request_interval;
        }

        Ok(())
    }
}
