use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use threepc_rs::{
    events::{AbortEvent, CommitEvent, StartElectionEvent, VoteEvent},
    process::{Configuration, Process, ProcessSpec},
    three_phase_commit::{
        messages::Vote,
        types::{Decision, TransactionSnapshot},
    },
    types::data_types::{ProcessID, TransactionID},
};

use crate::common::{
    mem_log::MemLog,
    network::NetworkStub,
    playlist_app::{Playlist, PlaylistCommand},
};

pub(crate) const KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(20);
pub(crate) const FAILURE_TIMEOUT: Duration = Duration::from_millis(150);
const TICK_PERIOD: Duration = Duration::from_millis(5);
const DECISION_REQUEST_INTERVAL: Duration = Duration::from_millis(50);

/// How long [`wait_until`] waits before failing the test.
const PATIENCE: Duration = Duration::from_secs(20);

/// Things the Nodes will have in common:
/// - Configuration (besides `me`).
///
/// Things that they will differ in:
/// - Network stub.
/// - Durable log.
/// - Playlist.
///
/// The durable log and the playlist survive [`kill`](Node::kill), so that [`revive`](Node::revive)
/// restarts the process the way a crashed process restarts on the same machine.
pub(crate) struct Node {
    me: ProcessID,
    num_processes: u32,
    network: NetworkStub,
    durable_log: MemLog,
    playlist: Playlist,
    decisions: Arc<Mutex<Vec<(TransactionID, Decision)>>>,
    elections: Arc<Mutex<Vec<TransactionID>>>,
    process: Option<Process>,
}

impl Node {
    pub(crate) fn new(me: ProcessID, num_processes: u32, network: NetworkStub) -> Node {
        let mut node = Node {
            me,
            num_processes,
            network,
            durable_log: MemLog::new(),
            playlist: Playlist::new(),
            decisions: Arc::new(Mutex::new(Vec::new())),
            elections: Arc::new(Mutex::new(Vec::new())),
            process: None,
        };
        node.revive();
        node
    }

    /// Crash the process. Its durable log and playlist are kept.
    pub(crate) fn kill(&mut self) {
        log::debug!("Killing process {}", self.me);
        self.process = None;
    }

    /// Restart the process from its durable log. Messages sent to it while it was down are lost.
    pub(crate) fn revive(&mut self) {
        assert!(self.process.is_none(), "process {} is running", self.me);
        log::debug!("Starting process {}", self.me);
        self.network.discard_inbox();

        let configuration = Configuration::builder()
            .me(self.me)
            .num_processes(self.num_processes)
            .keep_alive_interval(KEEP_ALIVE_INTERVAL)
            .failure_timeout(FAILURE_TIMEOUT)
            .tick_period(TICK_PERIOD)
            .decision_request_interval(DECISION_REQUEST_INTERVAL)
            .log_events(true)
            .build();

        let process = ProcessSpec::builder()
            .network(self.network.clone())
            .durable_log(self.durable_log.clone())
            .app(self.playlist.clone())
            .configuration(configuration)
            .on_vote(vote_handler(self.me))
            .on_commit(commit_handler(self.me, self.decisions.clone()))
            .on_abort(abort_handler(self.me, self.decisions.clone()))
            .on_start_election(start_election_handler(self.me, self.elections.clone()))
            .build()
            .start()
            .unwrap();

        self.process = Some(process);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.process.is_some()
    }

    pub(crate) fn process(&self) -> &Process {
        self.process
            .as_ref()
            .unwrap_or_else(|| panic!("process {} is not running", self.me))
    }

    pub(crate) fn me(&self) -> ProcessID {
        self.me
    }

    pub(crate) fn begin(&self, transaction: TransactionID, command: PlaylistCommand) {
        self.process().begin_transaction(transaction, command.payload());
    }

    pub(crate) fn transaction(&self, transaction: TransactionID) -> Option<TransactionSnapshot> {
        self.process().transaction(transaction)
    }

    /// The decision this node has reached on `transaction`, in this or an earlier incarnation.
    pub(crate) fn decision(&self, transaction: TransactionID) -> Option<Decision> {
        self.decisions
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| *id == transaction)
            .map(|(_, decision)| *decision)
    }

    /// Every decision this node has reached, including decisions re-announced after a restart.
    pub(crate) fn decisions(&self) -> Vec<(TransactionID, Decision)> {
        self.decisions.lock().unwrap().clone()
    }

    pub(crate) fn started_election_for(&self, transaction: TransactionID) -> bool {
        self.elections.lock().unwrap().contains(&transaction)
    }

    pub(crate) fn playlist(&self) -> &Playlist {
        &self.playlist
    }

    pub(crate) fn durable_log(&self) -> &MemLog {
        &self.durable_log
    }
}

/// Poll `condition` until it holds, failing the test if it does not hold within a generous deadline.
pub(crate) fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + PATIENCE;
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting until {}", what);
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Wait until every running node in `nodes` has decided `transaction`, and return their decisions.
pub(crate) fn wait_for_decisions(nodes: &[Node], transaction: TransactionID) -> Vec<Decision> {
    wait_until(&format!("transaction {} is decided", transaction), || {
        nodes
            .iter()
            .filter(|node| node.is_running())
            .all(|node| node.decision(transaction).is_some())
    });
    nodes
        .iter()
        .filter_map(|node| node.decision(transaction))
        .collect()
}

fn vote_handler(me: ProcessID) -> impl Fn(&VoteEvent) + Send + 'static {
    move |vote_event: &VoteEvent| {
        if vote_event.vote == Vote::No {
            log::debug!(
                "Process {} voted No on transaction {}",
                me,
                vote_event.transaction
            );
        }
    }
}

fn commit_handler(
    me: ProcessID,
    decisions: Arc<Mutex<Vec<(TransactionID, Decision)>>>,
) -> impl Fn(&CommitEvent) + Send + 'static {
    move |commit_event: &CommitEvent| {
        log::debug!("Process {} committed {}", me, commit_event.transaction);
        decisions
            .lock()
            .unwrap()
            .push((commit_event.transaction, Decision::Commit));
    }
}

fn abort_handler(
    me: ProcessID,
    decisions: Arc<Mutex<Vec<(TransactionID, Decision)>>>,
) -> impl Fn(&AbortEvent) + Send + 'static {
    move |abort_event: &AbortEvent| {
        log::debug!("Process {} aborted {}", me, abort_event.transaction);
        decisions
            .lock()
            .unwrap()
            .push((abort_event.transaction, Decision::Abort));
    }
}

fn start_election_handler(
    me: ProcessID,
    elections: Arc<Mutex<Vec<TransactionID>>>,
) -> impl Fn(&StartElectionEvent) + Send + 'static {
    move |start_election_event: &StartElectionEvent| {
        log::debug!(
            "Process {} elects {} for transaction {}",
            me,
            start_election_event.candidate,
            start_election_event.transaction
        );
        elections
            .lock()
            .unwrap()
            .push(start_election_event.transaction);
    }
}
