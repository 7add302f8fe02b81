/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and run a process.
//!
//! threepc_rs runs one instance of the three-phase commit protocol per transaction, across a fixed set of
//! `N` processes numbered `0..N`. Any process can begin a transaction, and becomes its coordinator. Every
//! other process participates.
//!
//! The key components of this module are:
//! - The builder-pattern interface to construct a [specification of the process](ProcessSpec) with:
//!   1. `ProcessSpec::builder` to construct a `ProcessSpecBuilder`,
//!   2. The setters of the `ProcessSpecBuilder`, and
//!   3. The `ProcessSpecBuilder::build` method to construct a [ProcessSpec],
//! - The function to [start](ProcessSpec::start) a [Process] given its specification,
//! - [The type](Process) which keeps the process alive, and which exposes the control hooks.
//!
//! ## Starting a process
//!
//! ```ignore
//! let process =
//!     ProcessSpec::builder()
//!     .network(network)
//!     .durable_log(FileLog::open("process-0.log", false)?)
//!     .app(app)
//!     .configuration(configuration)
//!     .on_commit(commit_handler)
//!     .build()
//!     .start()?;
//!
//! process.begin_transaction(TransactionID::new(1), Payload::new(bytes));
//! ```
//!
//! ### Required setters
//!
//! - `.network(...)`
//! - `.durable_log(...)`
//! - `.app(...)`
//! - `.configuration(...)`
//!
//! ### Optional setters
//!
//! The optional setters are for registering user-defined event handlers for events from [crate::events]:
//! - `.on_begin_transaction(...)`
//! - `.on_receive_message(...)`
//! - `.on_vote(...)`
//! - `.on_precommit(...)`
//! - `.on_commit(...)`
//! - `.on_abort(...)`
//! - `.on_start_election(...)`
//! - `.on_become_coordinator(...)`
//! - `.on_process_dead(...)`
//! - `.on_process_live(...)`
//! - `.on_recover_transaction(...)`
//!
//! ## Restarting a process
//!
//! A process that crashed (or whose [Process] handle was dropped) is restarted by starting a new
//! [ProcessSpec] with the same `me` and the same durable log. On start, the log is replayed and every
//! transaction in it is recovered before the main loop begins.
//!
//! ## Test hooks
//!
//! [`halt_after_messages`](Process::halt_after_messages), [`resume_sending`](Process::resume_sending), and
//! [`override_next_vote`](Process::override_next_vote) exist so that tests can place crashes at exact
//! points in the protocol. They are not visible to other processes.

use std::{
    collections::BTreeSet,
    fmt::{self, Display, Formatter},
    sync::{
        atomic::Ordering,
        mpsc::{self, Sender},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use typed_builder::TypedBuilder;

use crate::{
    app::App,
    durable_log::pluggables::DurableLog,
    event_bus::*,
    events::*,
    failure_monitor::implementation::{FailureMonitor, FailureMonitorConfiguration},
    networking::{network::Network, sending::SenderHandle},
    runtime::{lock, Runtime, RuntimeConfiguration, SharedState},
    three_phase_commit::{
        implementation::{ThreePhaseCommit, ThreePhaseCommitConfiguration, ThreePhaseCommitError},
        messages::Vote,
        types::{TransactionSnapshot, VoteOverride},
    },
    types::data_types::{Payload, ProcessID, TransactionID},
};

/// Stores the user-defined parameters required to start the process, that is:
/// 1. The process's own [ID](ProcessID), which is also its index in the process set.
/// 2. The size of the process set.
/// 3. How often keep-alives are sent to each other process.
/// 4. How long a process may stay silent before it is considered dead.
/// 5. How long the main loop sleeps between iterations.
/// 6. How often a recovered, undecided transaction asks the other processes for the decision.
/// 7. The "Log Events" flag, if set to "true" then logs should be printed.
///
/// ## Failure timeout
///
/// `failure_timeout` must be strictly greater than `keep_alive_interval`, and in practice should be
/// several times greater, so that a late keep-alive does not get a live process declared dead.
///
/// ## Log Events
///
/// threepc_rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
/// printed onto a terminal or to a file, set up a [logging
/// implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(Clone, Debug, TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.me(...)`
    - `.num_processes(...)`
    - `.keep_alive_interval(...)`
    - `.failure_timeout(...)`
    - `.tick_period(...)`
    - `.decision_request_interval(...)`
    - `.log_events(...)`
"))]
pub struct Configuration {
    #[builder(setter(doc = "Set the process's ID, which must be less than `num_processes`. Required."))]
    pub me: ProcessID,
    #[builder(setter(doc = "Set the number of processes in the process set. Required."))]
    pub num_processes: u32,
    #[builder(setter(doc = "Set how often keep-alives are sent to each other process. Required."))]
    pub keep_alive_interval: Duration,
    #[builder(setter(doc = "Set how long another process may stay silent before it is considered dead. Must be greater than the keep-alive interval. Required."))]
    pub failure_timeout: Duration,
    #[builder(setter(doc = "Set how long the main loop sleeps between iterations. Required."))]
    pub tick_period: Duration,
    #[builder(setter(doc = "Set how often a recovered, undecided transaction asks for the decision. Required."))]
    pub decision_request_interval: Duration,
    #[builder(setter(doc = "Enable logging? Required."))]
    pub log_events: bool,
}

impl Configuration {
    /// Check that the configuration describes a process that can run.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.num_processes == 0 {
            return Err(ConfigurationError::NoProcesses);
        }
        if self.me.int() >= self.num_processes {
            return Err(ConfigurationError::MeOutOfRange {
                me: self.me,
                num_processes: self.num_processes,
            });
        }
        if !self.failure_monitor_config().is_valid() {
            return Err(ConfigurationError::FailureTimeoutTooShort {
                keep_alive_interval: self.keep_alive_interval,
                failure_timeout: self.failure_timeout,
            });
        }
        Ok(())
    }

    fn failure_monitor_config(&self) -> FailureMonitorConfiguration {
        FailureMonitorConfiguration {
            me: self.me,
            num_processes: self.num_processes,
            interval: self.keep_alive_interval,
            timeout: self.failure_timeout,
        }
    }

    fn three_phase_commit_config(&self) -> ThreePhaseCommitConfiguration {
        ThreePhaseCommitConfiguration {
            me: self.me,
            num_processes: self.num_processes,
        }
    }

    fn runtime_config(&self) -> RuntimeConfiguration {
        RuntimeConfiguration {
            me: self.me,
            tick_period: self.tick_period,
            decision_request_interval: self.decision_request_interval,
        }
    }
}

/// Ways in which a [Configuration] can be invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    NoProcesses,
    MeOutOfRange {
        me: ProcessID,
        num_processes: u32,
    },
    FailureTimeoutTooShort {
        keep_alive_interval: Duration,
        failure_timeout: Duration,
    },
}

impl Display for ConfigurationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigurationError::NoProcesses => write!(f, "the process set is empty"),
            ConfigurationError::MeOutOfRange { me, num_processes } => write!(
                f,
                "process {} is outside of a process set of size {}",
                me, num_processes
            ),
            ConfigurationError::FailureTimeoutTooShort {
                keep_alive_interval,
                failure_timeout,
            } => write!(
                f,
                "failure timeout {:?} is not greater than keep-alive interval {:?}",
                failure_timeout, keep_alive_interval
            ),
        }
    }
}

impl std::error::Error for ConfigurationError {}

/// Reasons why [`ProcessSpec::start`] may fail.
#[derive(Debug)]
pub enum StartError {
    InvalidConfiguration(ConfigurationError),

    /// The durable log could not be read back, or is corrupt.
    Recovery(ThreePhaseCommitError),
}

impl From<ConfigurationError> for StartError {
    fn from(value: ConfigurationError) -> Self {
        StartError::InvalidConfiguration(value)
    }
}

impl From<ThreePhaseCommitError> for StartError {
    fn from(value: ThreePhaseCommitError) -> Self {
        StartError::Recovery(value)
    }
}

impl Display for StartError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StartError::InvalidConfiguration(err) => write!(f, "invalid configuration: {}", err),
            StartError::Recovery(err) => write!(f, "recovery failed: {}", err),
        }
    }
}

impl std::error::Error for StartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartError::InvalidConfiguration(err) => Some(err),
            StartError::Recovery(err) => Some(err),
        }
    }
}

/// Stores all necessary parameters and trait implementations required to run a [Process].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [ProcessSpec]. On the builder call the following methods to construct a valid [ProcessSpec].

    Required:
    - `.network(...)`
    - `.durable_log(...)`
    - `.app(...)`
    - `.configuration(...)`

    Optional:
    - `.on_begin_transaction(...)`
    - `.on_receive_message(...)`
    - `.on_vote(...)`
    - `.on_precommit(...)`
    - `.on_commit(...)`
    - `.on_abort(...)`
    - `.on_start_election(...)`
    - `.on_become_coordinator(...)`
    - `.on_process_dead(...)`
    - `.on_process_live(...)`
    - `.on_recover_transaction(...)`
"))]
pub struct ProcessSpec<N: Network + 'static, L: DurableLog, A: App> {
    // Required parameters
    #[builder(setter(doc = "Set the implementation of networking. The argument must implement the [Network](crate::networking::network::Network) trait. Required."))]
    network: N,
    #[builder(setter(doc = "Set the process's durable log. The argument must implement the [DurableLog](crate::durable_log::pluggables::DurableLog) trait. Required."))]
    durable_log: L,
    #[builder(setter(doc = "Set the application that committed transactions are applied to. The argument must implement the [App](crate::app::App) trait. Required."))]
    app: A,
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run a process. Required."))]
    configuration: Configuration,

    // Optional parameters
    #[builder(default, setter(transform = |handler: impl Fn(&BeginTransactionEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<BeginTransactionEvent>),
    doc = "Register a handler closure to be invoked after the process begins a transaction as its coordinator. Optional."))]
    on_begin_transaction: Option<HandlerPtr<BeginTransactionEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveMessageEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveMessageEvent>),
    doc = "Register a handler closure to be invoked after the process receives a protocol message from another process. Optional."))]
    on_receive_message: Option<HandlerPtr<ReceiveMessageEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&VoteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<VoteEvent>),
    doc = "Register a handler closure to be invoked after the process votes on a transaction. Optional."))]
    on_vote: Option<HandlerPtr<VoteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PrecommitEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PrecommitEvent>),
    doc = "Register a handler closure to be invoked after a transaction becomes committable at the process. Optional."))]
    on_precommit: Option<HandlerPtr<PrecommitEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CommitEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CommitEvent>),
    doc = "Register a handler closure to be invoked after the process decides to commit a transaction. Optional."))]
    on_commit: Option<HandlerPtr<CommitEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&AbortEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<AbortEvent>),
    doc = "Register a handler closure to be invoked after the process decides to abort a transaction. Optional."))]
    on_abort: Option<HandlerPtr<AbortEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StartElectionEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartElectionEvent>),
    doc = "Register a handler closure to be invoked after the process gives up on a transaction's coordinator and elects another. Optional."))]
    on_start_election: Option<HandlerPtr<StartElectionEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&BecomeCoordinatorEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<BecomeCoordinatorEvent>),
    doc = "Register a handler closure to be invoked after the process takes over as a transaction's coordinator. Optional."))]
    on_become_coordinator: Option<HandlerPtr<BecomeCoordinatorEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ProcessDeadEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ProcessDeadEvent>),
    doc = "Register a handler closure to be invoked after the failure monitor declares another process dead. Optional."))]
    on_process_dead: Option<HandlerPtr<ProcessDeadEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ProcessLiveEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ProcessLiveEvent>),
    doc = "Register a handler closure to be invoked after the failure monitor hears from a process it had declared dead. Optional."))]
    on_process_live: Option<HandlerPtr<ProcessLiveEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RecoverTransactionEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RecoverTransactionEvent>),
    doc = "Register a handler closure to be invoked for every transaction recovered from the durable log on start. Optional."))]
    on_recover_transaction: Option<HandlerPtr<RecoverTransactionEvent>>,
}

impl<N: Network + 'static, L: DurableLog, A: App> ProcessSpec<N, L, A> {
    /// Recovers the transactions in the durable log, then starts the threads associated with running a
    /// process, and returns the handles to them in a [Process] struct.
    pub fn start(self) -> Result<Process, StartError> {
        self.configuration.validate()?;
        let me = self.configuration.me;

        let event_handlers = EventHandlers::new(
            self.configuration.log_events,
            self.on_begin_transaction,
            self.on_receive_message,
            self.on_vote,
            self.on_precommit,
            self.on_commit,
            self.on_abort,
            self.on_start_election,
            self.on_become_coordinator,
            self.on_process_dead,
            self.on_process_live,
            self.on_recover_transaction,
        );

        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let failure_monitor = FailureMonitor::new(
            self.configuration.failure_monitor_config(),
            SenderHandle::new(self.network.clone()),
            Instant::now(),
            event_publisher.clone(),
        );

        // Until the failure monitor says otherwise, every other process is assumed to be live.
        let live: BTreeSet<ProcessID> = me.others(self.configuration.num_processes).collect();
        let vote_override = VoteOverride::new();
        let mut engine = ThreePhaseCommit::new(
            self.configuration.three_phase_commit_config(),
            self.durable_log,
            self.app,
            vote_override.clone(),
            event_publisher,
        );
        engine.recover(&live)?;

        let shared = SharedState::new();
        let (runtime_shutdown, runtime_shutdown_receiver) = mpsc::channel();
        let runtime = Runtime::new(
            self.configuration.runtime_config(),
            self.network,
            failure_monitor,
            engine,
            shared.clone(),
            runtime_shutdown_receiver,
        )
        .start();

        let (event_bus, event_bus_shutdown) = match event_subscriber {
            Some(event_subscriber) => {
                let (event_bus_shutdown, event_bus_shutdown_receiver) = mpsc::channel();
                let event_bus =
                    start_event_bus(event_handlers, event_subscriber, event_bus_shutdown_receiver);
                (Some(event_bus), Some(event_bus_shutdown))
            }
            None => (None, None),
        };

        log::debug!("Process {} started", me);

        Ok(Process {
            me,
            shared,
            vote_override,
            runtime: Some(runtime),
            runtime_shutdown,
            event_bus,
            event_bus_shutdown,
        })
    }
}

/// A handle to the background threads of a threepc_rs process. When this value is dropped, all background
/// threads are gracefully shut down. Dropping it is also how tests simulate a crash.
pub struct Process {
    me: ProcessID,
    shared: SharedState,
    vote_override: VoteOverride,
    runtime: Option<JoinHandle<()>>,
    runtime_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl Process {
    pub fn me(&self) -> ProcessID {
        self.me
    }

    /// Begin a new transaction with this process as its coordinator. The transaction starts on the main
    /// loop's next iteration. Beginning a transaction whose `id` this process already knows has no effect.
    pub fn begin_transaction(&self, id: TransactionID, payload: Payload) {
        lock(&self.shared.begin_requests).push_back((id, payload));
    }

    /// Stop sending protocol messages once `n` more have been sent. When the threshold is reached, the
    /// process also stops processing protocol messages (but keeps sending keep-alives) until
    /// [`resume_sending`](Self::resume_sending) is called.
    pub fn halt_after_messages(&self, n: u64) {
        lock(&self.shared.throttle).halt_after(n);
    }

    /// Lift the threshold set by [`halt_after_messages`](Self::halt_after_messages). Messages held back
    /// are sent in the order they were enqueued.
    pub fn resume_sending(&self) {
        lock(&self.shared.throttle).resume();
    }

    /// Make the next vote this process casts be `vote`. Later votes go back to [`Vote::Yes`].
    pub fn override_next_vote(&self, vote: Vote) {
        self.vote_override.set(vote);
    }

    /// The latest state of transaction `id` published by the main loop.
    pub fn transaction(&self, id: TransactionID) -> Option<TransactionSnapshot> {
        lock(&self.shared.snapshots).get(&id).cloned()
    }

    /// Whether the threshold set by [`halt_after_messages`](Self::halt_after_messages) has been reached.
    pub fn is_halted(&self) -> bool {
        lock(&self.shared.throttle).is_halted()
    }

    /// Whether the main loop has stopped because of a durable log error.
    pub fn has_failed(&self) -> bool {
        self.shared.failed.load(Ordering::SeqCst)
    }

    /// Number of protocol messages sent so far. Keep-alives are not counted.
    pub fn messages_sent(&self) -> u64 {
        lock(&self.shared.throttle).sent()
    }

    /// The other processes the failure monitor currently considers live.
    pub fn live_processes(&self) -> BTreeSet<ProcessID> {
        lock(&self.shared.liveness).live.clone()
    }

    /// The other processes the failure monitor has never considered dead.
    pub fn never_failed_processes(&self) -> BTreeSet<ProcessID> {
        lock(&self.shared.liveness).never_failed.clone()
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        // The main loop holds the event publishers, so it is stopped first. Sends fail only if the thread
        // already exited, which is fine.
        let _ = self.runtime_shutdown.send(());
        if let Some(runtime) = self.runtime.take() {
            if runtime.join().is_err() {
                log::error!("Process {}: main loop panicked", self.me);
            }
        }

        if let Some(shutdown) = self.event_bus_shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(event_bus) = self.event_bus.take() {
            if event_bus.join().is_err() {
                log::error!("Process {}: event bus panicked", self.me);
            }
        }
    }
}
