//! Durable storage backend for the normalized catalogs.
//!
//! - Write-ahead log of committed change sets for crash recovery
//! - Exclusive directory lock for single-process access
//! - CRC32 checksums on every frame
//! - Snapshot compaction to bound replay time
//!
//! # Layout
//!
//! ```text
//! <dir>/
//!   .kyronorm.lock   exclusive lock, holder pid
//!   catalog.snap     last compacted snapshot (optional)
//!   catalog.wal      change sets committed since the snapshot
//! ```

mod codec;
mod file_lock;
mod snapshot;
mod store;
mod wal;

pub use file_lock::FileLock;
pub use snapshot::SnapshotFile;
pub use store::{open_database, CompactionResult, PersistentNormalizationStore, WAL_FILE};
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};

use serde::{Deserialize, Serialize};

use crate::error::{NormError, ValidationError};

/// Configuration for persistent storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentConfig {
    /// WAL size that triggers compaction after a commit (bytes).
    pub max_wal_size: u64,
    /// Whether to fsync after every commit (slower but safer).
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 64 * 1024 * 1024, // 64 MB
            sync_on_write: true,
        }
    }
}

impl PersistentConfig {
    const MIN_WAL_SIZE: u64 = 4 * 1024; // avoids compacting after every write

    /// Checks the configuration.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if `max_wal_size` is below 4 KiB.
    pub fn validate(self) -> Result<Self, NormError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(ValidationError::InvalidConfig {
                reason: format!(
                    "max_wal_size must be at least {} bytes (got {})",
                    Self::MIN_WAL_SIZE,
                    self.max_wal_size
                ),
            }
            .into());
        }
        Ok(self)
    }
}
