//! Abstract storage contract for normalized catalogs.
//!
//! Backends must enforce two uniqueness constraints:
//! - `canonical_key` is unique per kind across active and inactive records
//! - `(concept_id, normalized_id)` is unique per kind in the link table
//!
//! Merges are applied through `apply_merge`, which must be atomic per cluster:
//! either every step of the cluster is visible afterwards or none is.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::alias::AliasEdge;
use crate::concept::Concept;
use crate::link::{ConceptId, ConceptLink, LinkOutcome};
use crate::record::{NewRecord, NormalizedId, NormalizedKind, NormalizedRecord};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Record not found.
    #[error("Normalized {0} record not found: {1}")]
    RecordNotFound(NormalizedKind, NormalizedId),

    /// Concept not found.
    #[error("Concept not found: {0}")]
    ConceptNotFound(ConceptId),

    /// A uniqueness constraint rejected the write.
    #[error("Constraint conflict: {0}")]
    ConstraintConflict(String),

    /// A merge precondition no longer holds (loser already inactive, etc.).
    #[error("Invalid merge: {0}")]
    InvalidMerge(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result of an idempotent create.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// No record held the key; a new one was inserted.
    Created(NormalizedRecord),
    /// An active record already held the key; its usage was incremented.
    Incremented(NormalizedRecord),
}

impl UpsertOutcome {
    /// Returns the record the fragment now resolves to.
    #[must_use]
    pub const fn record(&self) -> &NormalizedRecord {
        match self {
            Self::Created(r) | Self::Incremented(r) => r,
        }
    }

    /// Consumes the outcome, returning the record.
    #[must_use]
    pub fn into_record(self) -> NormalizedRecord {
        match self {
            Self::Created(r) | Self::Incremented(r) => r,
        }
    }
}

/// One cluster's rewrite, as decided by the winner selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMerge {
    pub kind: NormalizedKind,
    pub winner: NormalizedId,
    pub losers: Vec<NormalizedId>,
}

/// Counters of one applied cluster.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MergeOutcome {
    /// Loser links deleted because the concept already linked to the winner.
    pub removed_duplicate_links: usize,
    /// Loser links updated to point at the winner.
    pub repointed_links: usize,
    /// Concepts whose current normalized id moved from a loser to the winner.
    pub repointed_concepts: usize,
    /// Losers flipped to inactive.
    pub deactivated: usize,
    /// Usage added to the winner (sum of the losers' pre-merge usage).
    pub usage_transferred: u64,
    /// Winner usage after the merge.
    pub winner_usage_after: u64,
    /// Alias edges written or rewritten.
    pub aliases_written: usize,
}

/// Storage trait for the normalized catalogs, their links, aliases and the
/// concept boundary.
///
/// # Safety Considerations
/// - All mutations should be atomic
/// - Implementations should handle concurrent access safely
pub trait NormalizationStore: Send + Sync {
    /// Get a record by id (active or not).
    fn get_record(
        &self,
        kind: NormalizedKind,
        id: NormalizedId,
    ) -> Result<Option<NormalizedRecord>, StorageError>;

    /// Find the record holding a canonical key (active or not).
    fn find_by_key(
        &self,
        kind: NormalizedKind,
        key: &str,
    ) -> Result<Option<NormalizedRecord>, StorageError>;

    /// Snapshot of all active records of a kind.
    fn list_active(&self, kind: NormalizedKind) -> Result<Vec<NormalizedRecord>, StorageError>;

    /// Insert a new record.
    ///
    /// # Errors
    /// `ConstraintConflict` if any record (active or not) already holds the key.
    fn insert_record(&self, record: NormalizedRecord) -> Result<(), StorageError>;

    /// Create a record, or increment the usage of the active record already
    /// holding the key.
    ///
    /// # Errors
    /// `ConstraintConflict` if the key is held by an inactive record; the
    /// caller resolves the alias and retries against the winner.
    fn upsert_record(
        &self,
        kind: NormalizedKind,
        new: NewRecord,
    ) -> Result<UpsertOutcome, StorageError>;

    /// Add `by` to a record's usage and return the updated record.
    ///
    /// # Errors
    /// `ConstraintConflict` if the record is inactive.
    fn increment_usage(
        &self,
        kind: NormalizedKind,
        id: NormalizedId,
        by: u64,
    ) -> Result<NormalizedRecord, StorageError>;

    /// Write a concept link unless the pair already exists.
    fn link_concept(&self, link: ConceptLink) -> Result<LinkOutcome, StorageError>;

    /// Links pointing at a record.
    fn links_for_record(
        &self,
        kind: NormalizedKind,
        id: NormalizedId,
    ) -> Result<Vec<ConceptLink>, StorageError>;

    /// Links of a concept for one kind.
    fn links_for_concept(
        &self,
        kind: NormalizedKind,
        concept_id: ConceptId,
    ) -> Result<Vec<ConceptLink>, StorageError>;

    /// Get a concept's normalization state.
    fn get_concept(&self, id: ConceptId) -> Result<Option<Concept>, StorageError>;

    /// Point a concept at a record and stamp the normalization version.
    /// Creates the concept row if it is missing.
    fn set_concept_normalized(
        &self,
        id: ConceptId,
        kind: NormalizedKind,
        normalized_id: NormalizedId,
        version: &str,
    ) -> Result<Concept, StorageError>;

    /// Direct alias edge for a retired key, if any.
    fn get_alias(
        &self,
        kind: NormalizedKind,
        loser_key: &str,
    ) -> Result<Option<AliasEdge>, StorageError>;

    /// Apply one cluster merge atomically.
    fn apply_merge(&self, merge: &ClusterMerge) -> Result<MergeOutcome, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_store_object_safe(_: &dyn NormalizationStore) {}

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::RecordNotFound(NormalizedKind::Entity, NormalizedId::nil());
        assert!(err.to_string().contains("entity record not found"));

        let err = StorageError::ConstraintConflict("helado".to_string());
        assert!(err.to_string().contains("helado"));
    }
}
