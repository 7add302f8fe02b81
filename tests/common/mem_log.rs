//! [`MemLog`], an in-memory [`DurableLog`] that outlives the process using it.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use threepc_rs::{
    durable_log::pluggables::{DurableLog, LogError},
    three_phase_commit::messages::ProtocolMessage,
};

/// A durable log kept in memory.
///
/// Clones share the same entries, so a test can hand one clone to a process, drop the process to simulate
/// a crash, and hand another clone to the restarted process.
#[derive(Clone, Default)]
pub(crate) struct MemLog {
    entries: Arc<Mutex<Vec<ProtocolMessage>>>,
    failing: Arc<AtomicBool>,
}

impl MemLog {
    pub(crate) fn new() -> MemLog {
        Self::default()
    }

    /// Make every later `append` fail, as if the disk had gone away.
    pub(crate) fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst)
    }

    /// The kind of every entry, oldest first.
    pub(crate) fn kinds(&self) -> Vec<&'static str> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|entry| entry.kind())
            .collect()
    }
}

impl DurableLog for MemLog {
    fn append(&mut self, entry: &ProtocolMessage) -> Result<(), LogError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LogError::Unavailable);
        }
        self.entries.lock().unwrap().push(entry.clone());
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<ProtocolMessage>, LogError> {
        Ok(self.entries.lock().unwrap().clone())
    }
}
