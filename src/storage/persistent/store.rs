//! WAL-backed normalization store.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockWriteGuard};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::file_lock::FileLock;
use super::snapshot::{self, SnapshotFile};
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;
use crate::alias::AliasEdge;
use crate::concept::Concept;
use crate::error::NormResult;
use crate::link::{ConceptId, ConceptLink, LinkOutcome};
use crate::record::{NewRecord, NormalizedId, NormalizedKind, NormalizedRecord};
use crate::storage::{
    ChangeSet, ClusterMerge, MergeOutcome, NormalizationStore, StorageError, StoreSnapshot,
    StoreState, UpsertOutcome,
};

/// File name of the write-ahead log inside the data directory.
pub const WAL_FILE: &str = "catalog.wal";

fn lock_err(context: &'static str) -> StorageError {
    StorageError::Backend(format!("poisoned lock: {context}"))
}

fn io_err(context: &str, e: &std::io::Error) -> StorageError {
    StorageError::Backend(format!("{context}: {e}"))
}

/// Result of a compaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactionResult {
    /// WAL sequence covered by the new snapshot.
    pub up_to_sequence: u64,
    /// Rows written to the snapshot.
    pub rows: usize,
    /// WAL size before compaction.
    pub wal_size_before: u64,
    /// WAL size after compaction.
    pub wal_size_after: u64,
}

/// Durable single-process store: snapshot + WAL + in-memory state.
pub struct PersistentNormalizationStore {
    dir: PathBuf,
    _lock: FileLock,
    wal: WriteAheadLog,
    state: RwLock<StoreState>,
    config: PersistentConfig,
}

impl PersistentNormalizationStore {
    /// Opens or creates a store in `dir`.
    ///
    /// Loads the snapshot, then replays WAL commits newer than it.
    ///
    /// # Errors
    /// Returns `Backend` if the directory cannot be created or locked, or if
    /// the snapshot or a WAL entry is corrupted.
    pub fn open(dir: &Path, config: PersistentConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(dir).map_err(|e| io_err("failed to create data directory", &e))?;
        let lock = FileLock::acquire(dir).map_err(|e| io_err("failed to acquire lock", &e))?;

        let mut state = StoreState::default();
        let base_sequence = match snapshot::load(dir).map_err(|e| io_err("failed to load snapshot", &e))? {
            Some(file) => {
                debug!(rows = file.data.row_count(), up_to = file.up_to_sequence, "loaded snapshot");
                state.apply(&file.data.into_change_set());
                file.up_to_sequence
            }
            None => 0,
        };

        let wal = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write, base_sequence)
            .map_err(|e| io_err("failed to open WAL", &e))?;

        let mut replayed = 0usize;
        for entry in wal.iter().map_err(|e| io_err("failed to read WAL", &e))? {
            let entry = entry.map_err(|e| io_err("corrupted WAL entry", &e))?;
            if entry.sequence <= base_sequence {
                continue;
            }
            if let WalEntryKind::Commit(changes) = entry.kind {
                state.apply(&changes);
                replayed += 1;
            }
        }
        if replayed > 0 {
            info!(dir = %dir.display(), replayed, "replayed WAL commits");
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            wal,
            state: RwLock::new(state),
            config,
        })
    }

    /// Data directory of the store.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current WAL size in bytes.
    ///
    /// # Errors
    /// Returns `Backend` if the file cannot be inspected.
    pub fn wal_size(&self) -> Result<u64, StorageError> {
        self.wal.size_bytes().map_err(|e| io_err("failed to stat WAL", &e))
    }

    /// Copies every row out of the store.
    ///
    /// # Errors
    /// Returns `Backend` if the lock is poisoned.
    pub fn snapshot(&self) -> Result<StoreSnapshot, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("store.snapshot"))?;
        Ok(state.snapshot())
    }

    /// Writes a snapshot of the current state and empties the WAL.
    ///
    /// Safe to interrupt: until the WAL is truncated, replay re-applies
    /// entries the snapshot already holds, and every mutation is an absolute
    /// row write.
    ///
    /// # Errors
    /// Returns `Backend` on I/O failure; the WAL is left intact.
    pub fn compact(&self) -> Result<CompactionResult, StorageError> {
        let state = self.state.write().map_err(|_| lock_err("store.compact"))?;
        self.compact_locked(&state)
    }

    fn compact_locked(&self, state: &StoreState) -> Result<CompactionResult, StorageError> {
        let wal_size_before = self.wal_size()?;
        let up_to_sequence = self
            .wal
            .current_sequence()
            .map_err(|e| io_err("failed to read WAL sequence", &e))?;
        let data = state.snapshot();
        let rows = data.row_count();

        snapshot::write(
            &self.dir,
            &SnapshotFile {
                up_to_sequence,
                created_at: Utc::now(),
                data,
            },
        )
        .map_err(|e| io_err("failed to write snapshot", &e))?;
        self.wal
            .truncate()
            .map_err(|e| io_err("failed to truncate WAL", &e))?;
        self.wal
            .append(WalEntryKind::Checkpoint { up_to_sequence })
            .map_err(|e| io_err("failed to write checkpoint", &e))?;

        let wal_size_after = self.wal_size()?;
        info!(up_to_sequence, rows, wal_size_before, wal_size_after, "compacted catalog");
        Ok(CompactionResult {
            up_to_sequence,
            rows,
            wal_size_before,
            wal_size_after,
        })
    }

    fn write(&self, context: &'static str) -> Result<RwLockWriteGuard<'_, StoreState>, StorageError> {
        self.state.write().map_err(|_| lock_err(context))
    }

    /// Logs then applies a change set. Callers hold the state write lock so
    /// WAL order matches apply order.
    fn commit_logged(
        &self,
        state: &mut StoreState,
        changes: ChangeSet,
    ) -> Result<(), StorageError> {
        if changes.is_empty() {
            return Ok(());
        }
        self.wal
            .append(WalEntryKind::Commit(changes.clone()))
            .map_err(|e| io_err("failed to append WAL entry", &e))?;
        state.apply(&changes);

        match self.wal_size() {
            Ok(size) if size > self.config.max_wal_size => {
                if let Err(e) = self.compact_locked(state) {
                    warn!(error = %e, "automatic compaction failed; WAL kept");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not check WAL size"),
        }
        Ok(())
    }
}

impl NormalizationStore for PersistentNormalizationStore {
    fn get_record(
        &self,
        kind: NormalizedKind,
        id: NormalizedId,
    ) -> Result<Option<NormalizedRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("record.get"))?;
        Ok(state.get_record(kind, id))
    }

    fn find_by_key(
        &self,
        kind: NormalizedKind,
        key: &str,
    ) -> Result<Option<NormalizedRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("record.find_by_key"))?;
        Ok(state.find_by_key(kind, key))
    }

    fn list_active(&self, kind: NormalizedKind) -> Result<Vec<NormalizedRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("record.list_active"))?;
        Ok(state.list_active(kind))
    }

    fn insert_record(&self, record: NormalizedRecord) -> Result<(), StorageError> {
        let mut state = self.write("record.insert")?;
        let changes = state.plan_insert(record)?;
        self.commit_logged(&mut state, changes)
    }

    fn upsert_record(
        &self,
        kind: NormalizedKind,
        new: NewRecord,
    ) -> Result<UpsertOutcome, StorageError> {
        let mut state = self.write("record.upsert")?;
        let (changes, outcome) = state.plan_upsert(kind, new, Utc::now())?;
        self.commit_logged(&mut state, changes)?;
        Ok(outcome)
    }

    fn increment_usage(
        &self,
        kind: NormalizedKind,
        id: NormalizedId,
        by: u64,
    ) -> Result<NormalizedRecord, StorageError> {
        let mut state = self.write("record.increment")?;
        let (changes, record) = state.plan_increment(kind, id, by, Utc::now())?;
        self.commit_logged(&mut state, changes)?;
        Ok(record)
    }

    fn link_concept(&self, link: ConceptLink) -> Result<LinkOutcome, StorageError> {
        let mut state = self.write("link.insert")?;
        let (changes, outcome) = state.plan_link(link)?;
        self.commit_logged(&mut state, changes)?;
        Ok(outcome)
    }

    fn links_for_record(
        &self,
        kind: NormalizedKind,
        id: NormalizedId,
    ) -> Result<Vec<ConceptLink>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("link.for_record"))?;
        Ok(state.links_for_record(kind, id))
    }

    fn links_for_concept(
        &self,
        kind: NormalizedKind,
        concept_id: ConceptId,
    ) -> Result<Vec<ConceptLink>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("link.for_concept"))?;
        Ok(state.links_for_concept(kind, concept_id))
    }

    fn get_concept(&self, id: ConceptId) -> Result<Option<Concept>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("concept.get"))?;
        Ok(state.get_concept(id))
    }

    fn set_concept_normalized(
        &self,
        id: ConceptId,
        kind: NormalizedKind,
        normalized_id: NormalizedId,
        version: &str,
    ) -> Result<Concept, StorageError> {
        let mut state = self.write("concept.set")?;
        let (changes, concept) =
            state.plan_set_concept(id, kind, normalized_id, version, Utc::now())?;
        self.commit_logged(&mut state, changes)?;
        Ok(concept)
    }

    fn get_alias(
        &self,
        kind: NormalizedKind,
        loser_key: &str,
    ) -> Result<Option<AliasEdge>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("alias.get"))?;
        Ok(state.get_alias(kind, loser_key))
    }

    fn apply_merge(&self, merge: &ClusterMerge) -> Result<MergeOutcome, StorageError> {
        let mut state = self.write("merge.apply")?;
        let (changes, outcome) = state.plan_merge(merge, Utc::now())?;
        self.commit_logged(&mut state, changes)?;
        Ok(outcome)
    }
}

/// Opens or creates a persistent catalog at `path`.
///
/// # Errors
/// - If the configuration is invalid
/// - If the path cannot be created or another process holds the lock
/// - If the snapshot or WAL is corrupted
///
/// # Example
/// ```rust,ignore
/// use kyronorm::storage::persistent::open_database;
///
/// let store = open_database("./catalog", None)?;
/// let normalizer = Normalizer::new(Arc::new(store), oracle, config)?;
/// ```
pub fn open_database(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> NormResult<PersistentNormalizationStore> {
    let config = config.unwrap_or_default().validate()?;
    Ok(PersistentNormalizationStore::open(path.as_ref(), config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confidence::Confidence;
    use crate::record::CreatedBy;
    use tempfile::tempdir;

    fn new_record(key: &str) -> NewRecord {
        NewRecord {
            canonical_key: key.to_string(),
            display_name: key.to_string(),
            description: String::new(),
            examples: Vec::new(),
            confidence: Confidence::clamped(0.9),
            created_by: CreatedBy::Ai,
        }
    }

    #[test]
    fn test_reopen_replays_writes() {
        let dir = tempdir().unwrap();
        let id = {
            let store = open_database(dir.path(), None).unwrap();
            let rec = store
                .upsert_record(NormalizedKind::Entity, new_record("helado"))
                .unwrap()
                .into_record();
            store
                .upsert_record(NormalizedKind::Entity, new_record("helado"))
                .unwrap();
            rec.id
        };
        let store = open_database(dir.path(), None).unwrap();
        let rec = store.get_record(NormalizedKind::Entity, id).unwrap().unwrap();
        assert_eq!(rec.usage_count, 2);
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = tempdir().unwrap();
        let _store = open_database(dir.path(), None).unwrap();
        let err = open_database(dir.path(), None).err().unwrap();
        assert!(err.to_string().contains("lock"));
    }

    #[test]
    fn test_compaction_then_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = open_database(dir.path(), None).unwrap();
            store
                .upsert_record(NormalizedKind::Aspect, new_record("sabor"))
                .unwrap();
            let result = store.compact().unwrap();
            assert_eq!(result.up_to_sequence, 1);
            assert_eq!(result.rows, 1);
            store
                .upsert_record(NormalizedKind::Aspect, new_record("precio"))
                .unwrap();
        }
        let store = open_database(dir.path(), None).unwrap();
        assert_eq!(store.list_active(NormalizedKind::Aspect).unwrap().len(), 2);
        let sabor = store.find_by_key(NormalizedKind::Aspect, "sabor").unwrap().unwrap();
        assert_eq!(sabor.usage_count, 1);
    }

    #[test]
    fn test_rejected_write_is_not_logged() {
        let dir = tempdir().unwrap();
        let store = open_database(dir.path(), None).unwrap();
        let before = store.wal_size().unwrap();
        let missing = store.increment_usage(NormalizedKind::Entity, NormalizedId::new(), 1);
        assert!(missing.is_err());
        assert_eq!(store.wal_size().unwrap(), before);
    }
}
