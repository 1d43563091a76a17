//! Aliases: redirects from keys retired by a merge to the winner's key.
//!
//! Without aliases, a fragment whose key belonged to a merged-away record
//! would create a fresh record and resurrect the duplicate. The resolver
//! follows edges until it reaches an active record.
//!
//! Chains are compressed when a merge is applied (edges that pointed at a new
//! loser are rewritten to the new winner) and also followed hop by hop at
//! lookup time, so older stores with uncompressed chains still resolve.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::record::{NormalizedKind, NormalizedRecord};
use crate::storage::{NormalizationStore, StorageError};

/// Upper bound on hops followed during one lookup.
pub const MAX_ALIAS_HOPS: usize = 32;

/// A redirect `loser_key -> winner_key` within one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasEdge {
    pub kind: NormalizedKind,
    pub loser_key: String,
    pub winner_key: String,
    pub created_at: DateTime<Utc>,
}

impl AliasEdge {
    /// Creates an edge stamped now.
    #[must_use]
    pub fn new(kind: NormalizedKind, loser_key: impl Into<String>, winner_key: impl Into<String>) -> Self {
        Self {
            kind,
            loser_key: loser_key.into(),
            winner_key: winner_key.into(),
            created_at: Utc::now(),
        }
    }
}

/// Where a key resolves to.
#[derive(Debug, Clone, PartialEq)]
pub struct AliasTarget {
    /// The active record now standing for the key.
    pub record: NormalizedRecord,
    /// Alias edges followed; zero when the key itself is active.
    pub hops: usize,
}

impl AliasTarget {
    /// Returns true if at least one alias edge was followed.
    #[must_use]
    pub const fn redirected(&self) -> bool {
        self.hops > 0
    }
}

/// Resolves canonical keys to the active record that currently owns them.
pub struct AliasResolver<'a> {
    store: &'a dyn NormalizationStore,
}

impl<'a> AliasResolver<'a> {
    /// Creates a resolver over a store.
    #[must_use]
    pub fn new(store: &'a dyn NormalizationStore) -> Self {
        Self { store }
    }

    /// Resolves a key.
    ///
    /// Returns `None` when the key is unknown, when a chain ends at an
    /// inactive record without a further edge, or when a chain loops or
    /// exceeds `MAX_ALIAS_HOPS`.
    ///
    /// # Errors
    /// Propagates storage errors.
    pub fn resolve(
        &self,
        kind: NormalizedKind,
        key: &str,
    ) -> Result<Option<AliasTarget>, StorageError> {
        let mut current = key.to_string();
        let mut seen: HashSet<String> = HashSet::new();

        for hops in 0..=MAX_ALIAS_HOPS {
            if !seen.insert(current.clone()) {
                warn!(kind = %kind, key = %key, at = %current, "alias chain loops");
                return Ok(None);
            }

            if let Some(record) = self.store.find_by_key(kind, &current)? {
                if record.is_active {
                    return Ok(Some(AliasTarget { record, hops }));
                }
            }

            match self.store.get_alias(kind, &current)? {
                Some(edge) => current = edge.winner_key,
                None => return Ok(None),
            }
        }

        warn!(kind = %kind, key = %key, max = MAX_ALIAS_HOPS, "alias chain exceeds hop limit");
        Ok(None)
    }

    /// Resolves a key only if it was retired by a merge.
    ///
    /// Keys that are themselves active, or unknown, return `None`.
    ///
    /// # Errors
    /// Propagates storage errors.
    pub fn redirect(
        &self,
        kind: NormalizedKind,
        key: &str,
    ) -> Result<Option<AliasTarget>, StorageError> {
        Ok(self.resolve(kind, key)?.filter(AliasTarget::redirected))
    }
}
