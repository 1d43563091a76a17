//! Write-ahead log of committed change sets.
//!
//! A change set is appended (and optionally fsynced) before it is applied to
//! memory, so every acknowledged write survives a crash. One merge cluster is
//! one entry: replay sees either the whole cluster or none of it.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: codec frame of WalEntry]
//! [ENTRY 2: codec frame of WalEntry]
//! ...
//! ```
//!
//! A torn tail (partial last frame) is cut off on open; sequence numbers keep
//! increasing across compactions.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::codec;
use crate::storage::ChangeSet;

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// The logged operation.
    pub kind: WalEntryKind,
}

/// What a WAL entry records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalEntryKind {
    /// A committed change set.
    Commit(ChangeSet),
    /// Everything up to this sequence is in the snapshot file.
    Checkpoint { up_to_sequence: u64 },
}

struct WalState {
    writer: BufWriter<File>,
    sequence: u64,
}

fn poisoned() -> IoError {
    IoError::new(ErrorKind::Other, "poisoned lock: wal")
}

/// Append-only log, thread-safe via an internal mutex.
pub struct WriteAheadLog {
    path: PathBuf,
    state: Mutex<WalState>,
    sync_on_write: bool,
}

impl WriteAheadLog {
    /// Opens or creates a WAL file.
    ///
    /// `base_sequence` is the last sequence already covered by a snapshot;
    /// numbering resumes after the larger of it and the last logged entry.
    pub fn open(path: &Path, sync_on_write: bool, base_sequence: u64) -> IoResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        let last_sequence = if len < codec::HEADER_LEN {
            file.set_len(0)?;
            codec::write_header(&mut file)?;
            if sync_on_write {
                file.sync_all()?;
            }
            0
        } else {
            let (last, valid_end) = Self::scan(path)?;
            if valid_end < len {
                warn!(
                    path = %path.display(),
                    valid_end,
                    file_len = len,
                    "truncating torn WAL tail"
                );
                file.set_len(valid_end)?;
                file.sync_all()?;
            }
            last
        };
        drop(file);

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(WalState {
                writer: BufWriter::new(file),
                sequence: last_sequence.max(base_sequence),
            }),
            sync_on_write,
        })
    }

    fn lock(&self) -> IoResult<MutexGuard<'_, WalState>> {
        self.state.lock().map_err(|_| poisoned())
    }

    /// Appends an entry and returns its sequence number.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut state = self.lock()?;
        let sequence = state.sequence + 1;
        let encoded = codec::encode(&WalEntry {
            sequence,
            timestamp: Utc::now(),
            kind,
        })?;

        state.writer.write_all(&encoded)?;
        state.writer.flush()?;
        if self.sync_on_write {
            state.writer.get_ref().sync_data()?;
        }
        state.sequence = sequence;
        Ok(sequence)
    }

    /// Iterates every entry in the file.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// Last assigned sequence number.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(self.lock()?.sequence)
    }

    /// WAL file size in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Drops every entry, keeping the sequence counter.
    ///
    /// Only call this after the snapshot covering the entries is durable.
    pub fn truncate(&self) -> IoResult<()> {
        let mut state = self.lock()?;
        state.writer.flush()?;
        let file = state.writer.get_mut();
        file.set_len(0)?;
        codec::write_header(file)?;
        if self.sync_on_write {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Returns the last valid sequence and the byte offset where valid data ends.
    fn scan(path: &Path) -> IoResult<(u64, u64)> {
        let mut iter = WalIterator::new(path)?;
        let mut last = 0;
        let mut valid_end = codec::HEADER_LEN;
        while let Some(entry) = iter.next() {
            match entry {
                Ok(entry) => {
                    last = entry.sequence;
                    valid_end = iter.position()?;
                }
                Err(e) => {
                    warn!(after_sequence = last, error = %e, "WAL corruption detected");
                    break;
                }
            }
        }
        Ok((last, valid_end))
    }
}

/// Iterator over WAL entries. Stops at a truncated trailing frame.
pub struct WalIterator {
    reader: BufReader<File>,
    file_size: u64,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader)?;
        Ok(Self { reader, file_size })
    }

    fn position(&mut self) -> IoResult<u64> {
        self.reader.stream_position()
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.position() {
            Ok(pos) if pos >= self.file_size => return None,
            Ok(_) => {}
            Err(e) => return Some(Err(e)),
        }
        match codec::decode(&mut self.reader) {
            Ok(entry) => Some(Ok(entry)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => None,
            Err(e) => Some(Err(e)),
        }
    }
}
