/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A [`DurableLog`] backed by a single append-only file.
//!
//! ## Record format
//!
//! The file is a sequence of records, each laid out as:
//! 1. The length of the body in bytes, as a little-endian `u32`.
//! 2. The first 4 bytes of the SHA-256 digest of the length field.
//! 3. The SHA-256 digest of the body (32 bytes).
//! 4. The body: the Borsh serialization of a [`ProtocolMessage`].
//!
//! Every [`append`](DurableLog::append) writes exactly one record and syncs the file's data to disk
//! before returning.
//!
//! ## Torn writes
//!
//! A crash in the middle of an append can leave an incomplete record at the end of the file. That append
//! never returned, so nothing that depended on it was sent; the incomplete record is discarded (and cut off
//! the file when it is opened). A record is only taken to be torn if its header is cut short, or if its
//! header is intact and checked but its body runs past the end of the file. Any other malformed record,
//! including one whose length field fails its check or whose digest does not match its body, is reported
//! as [`LogError::Corrupt`], and the file is left untouched.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest, Sha256};

use crate::three_phase_commit::messages::ProtocolMessage;

use super::pluggables::{DurableLog, LogError};

const LEN_BYTES: usize = 4;
const LEN_CHECK_BYTES: usize = 4;
const DIGEST_BYTES: usize = 32;
const HEADER_BYTES: usize = LEN_BYTES + LEN_CHECK_BYTES + DIGEST_BYTES;

pub struct FileLog {
    path: PathBuf,
    file: File,
    // Length of the valid prefix of the file.
    len: u64,
    // Set when a failed append could not be rolled back. The file may then end in a partial record, so
    // nothing more is appended to it.
    broken: bool,
}

impl FileLog {
    /// Open the log stored at `path`, creating it if it does not exist.
    ///
    /// If `reset` is true, any existing log at `path` is deleted first and the process starts with empty
    /// stable storage. Otherwise the existing log is validated (so that a corrupt log is reported before
    /// anything is appended to it) and kept for recovery.
    pub fn open(path: impl AsRef<Path>, reset: bool) -> Result<FileLog, LogError> {
        let path = path.as_ref().to_path_buf();
        if reset {
            match fs::remove_file(&path) {
                Ok(()) => (),
                Err(err) if err.kind() == io::ErrorKind::NotFound => (),
                Err(err) => return Err(err.into()),
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let bytes = fs::read(&path)?;
        let (_, valid_len) = decode_records(&bytes)?;
        if valid_len < bytes.len() {
            log::warn!(
                "Discarding {} bytes of an incomplete record at the end of {}",
                bytes.len() - valid_len,
                path.display()
            );
            file.set_len(valid_len as u64)?;
        }
        file.sync_all()?;

        Ok(FileLog {
            path,
            file,
            len: valid_len as u64,
            broken: false,
        })
    }

    /// Get the location of this log on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DurableLog for FileLog {
    fn append(&mut self, entry: &ProtocolMessage) -> Result<(), LogError> {
        if self.broken {
            return Err(LogError::Unavailable);
        }

        let body = entry
            .try_to_vec()
            .map_err(|err| LogError::SerializeError { source: err })?;
        let record = encode_record(&body)?;

        let result = self
            .file
            .write_all(&record)
            .and_then(|()| self.file.sync_data());
        match result {
            Ok(()) => {
                self.len += record.len() as u64;
                Ok(())
            }
            Err(err) => {
                // Do not leave a partial record behind for the next append to be written after.
                if let Err(rollback_err) = self.file.set_len(self.len) {
                    log::error!(
                        "Could not cut a failed append off {}, refusing further appends: {}",
                        self.path.display(),
                        rollback_err
                    );
                    self.broken = true;
                }
                Err(err.into())
            }
        }
    }

    fn read_all(&self) -> Result<Vec<ProtocolMessage>, LogError> {
        let bytes = fs::read(&self.path)?;
        let (entries, valid_len) = decode_records(&bytes)?;
        if valid_len < bytes.len() {
            log::warn!(
                "Ignoring an incomplete record at the end of {}",
                self.path.display()
            );
        }
        Ok(entries)
    }
}

fn len_check(len_bytes: &[u8]) -> [u8; LEN_CHECK_BYTES] {
    let mut check = [0u8; LEN_CHECK_BYTES];
    check.copy_from_slice(&Sha256::digest(len_bytes)[..LEN_CHECK_BYTES]);
    check
}

fn encode_record(body: &[u8]) -> Result<Vec<u8>, LogError> {
    let body_len = u32::try_from(body.len()).map_err(|_| LogError::SerializeError {
        source: io::Error::new(io::ErrorKind::InvalidInput, "log entry is too large"),
    })?;
    let len_bytes = body_len.to_le_bytes();

    let mut record = Vec::with_capacity(HEADER_BYTES + body.len());
    record.extend_from_slice(&len_bytes);
    record.extend_from_slice(&len_check(&len_bytes));
    record.extend_from_slice(Sha256::digest(body).as_slice());
    record.extend_from_slice(body);
    Ok(record)
}

/// Decode every complete record in `bytes`. Returns the decoded entries and the number of bytes they
/// occupy; anything after that is an incomplete final record.
fn decode_records(bytes: &[u8]) -> Result<(Vec<ProtocolMessage>, usize), LogError> {
    let mut entries = Vec::new();
    let mut offset = 0;

    while bytes.len() - offset >= HEADER_BYTES {
        let len_bytes = &bytes[offset..offset + LEN_BYTES];
        let check = &bytes[offset + LEN_BYTES..offset + LEN_BYTES + LEN_CHECK_BYTES];
        if len_check(len_bytes).as_slice() != check {
            return Err(LogError::Corrupt {
                position: entries.len(),
                reason: String::from("length field does not match its check"),
            });
        }
        let mut len_array = [0u8; LEN_BYTES];
        len_array.copy_from_slice(len_bytes);
        let body_len = u32::from_le_bytes(len_array) as usize;

        // With a checked length, a body that runs past the end of the file can only belong to the last
        // record.
        let body_start = offset + HEADER_BYTES;
        if bytes.len() - body_start < body_len {
            break;
        }

        let digest = &bytes[offset + LEN_BYTES + LEN_CHECK_BYTES..body_start];
        let body = &bytes[body_start..body_start + body_len];
        if Sha256::digest(body).as_slice() != digest {
            return Err(LogError::Corrupt {
                position: entries.len(),
                reason: String::from("digest does not match the entry"),
            });
        }

        let entry = ProtocolMessage::try_from_slice(body).map_err(|err| LogError::Corrupt {
            position: entries.len(),
            reason: err.to_string(),
        })?;
        entries.push(entry);
        offset = body_start + body_len;
    }

    Ok((entries, offset))
}
