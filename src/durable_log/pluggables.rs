/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait definition for pluggable durable logs, and the errors they report.

use std::{
    fmt::{self, Display, Formatter},
    io,
};

use crate::three_phase_commit::messages::ProtocolMessage;

/// Stable storage for the three-phase commit protocol.
///
/// # Durability
///
/// When `append` returns `Ok`, the entry must survive a crash of the process. When it returns `Err`, the
/// entry may or may not have been written, and the caller must not act as if it had been.
///
/// # Ordering
///
/// `read_all` returns every entry appended so far, oldest first, exactly as appended.
pub trait DurableLog: Send + 'static {
    fn append(&mut self, entry: &ProtocolMessage) -> Result<(), LogError>;

    fn read_all(&self) -> Result<Vec<ProtocolMessage>, LogError>;
}

#[derive(Debug)]
pub enum LogError {
    /// Reading from or writing to the underlying storage failed.
    IoError { source: io::Error },

    /// An entry could not be serialized.
    SerializeError { source: io::Error },

    /// The entry at `position` (0-based) could not be interpreted. Recovery cannot proceed with a log it
    /// cannot fully read.
    Corrupt { position: usize, reason: String },

    /// The log refused the write. Used by implementations that can be taken out of service, or that could
    /// not undo an earlier failed write.
    Unavailable,
}

impl Display for LogError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LogError::IoError { source } => write!(f, "durable log I/O error: {}", source),
            LogError::SerializeError { source } => {
                write!(f, "failed to serialize log entry: {}", source)
            }
            LogError::Corrupt { position, reason } => {
                write!(f, "log entry {} is corrupt: {}", position, reason)
            }
            LogError::Unavailable => write!(f, "durable log is unavailable"),
        }
    }
}

impl std::error::Error for LogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LogError::IoError { source } | LogError::SerializeError { source } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for LogError {
    fn from(value: io::Error) -> Self {
        LogError::IoError { source: value }
    }
}
