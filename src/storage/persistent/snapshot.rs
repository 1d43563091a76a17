//! Snapshot file written by compaction.
//!
//! The snapshot is written to a temporary file, fsynced, then renamed over
//! the previous one, so a crash leaves either the old or the new snapshot and
//! never a partial file. `up_to_sequence` tells replay which WAL entries the
//! snapshot already contains.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Result as IoResult, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::codec;
use crate::storage::StoreSnapshot;

/// File name of the snapshot inside the data directory.
pub const SNAPSHOT_FILE: &str = "catalog.snap";
const SNAPSHOT_TMP: &str = "catalog.snap.tmp";

/// On-disk snapshot contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFile {
    /// Last WAL sequence included in `data`.
    pub up_to_sequence: u64,
    /// When compaction wrote the file.
    pub created_at: DateTime<Utc>,
    /// Every row of the store.
    pub data: StoreSnapshot,
}

/// Loads the snapshot in `dir`, if one exists.
pub fn load(dir: &Path) -> IoResult<Option<SnapshotFile>> {
    let file = match File::open(dir.join(SNAPSHOT_FILE)) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    codec::read_header(&mut reader)?;
    codec::decode(&mut reader).map(Some)
}

/// Atomically replaces the snapshot in `dir`.
pub fn write(dir: &Path, snapshot: &SnapshotFile) -> IoResult<()> {
    let tmp = dir.join(SNAPSHOT_TMP);
    {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        let mut writer = BufWriter::new(file);
        codec::write_header(&mut writer)?;
        writer.write_all(&codec::encode(snapshot)?)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, dir.join(SNAPSHOT_FILE))?;

    #[cfg(unix)]
    File::open(dir)?.sync_all()?;

    Ok(())
}
