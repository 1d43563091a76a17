//! Concept links: the join rows between upstream concepts and normalized records.
//!
//! A concept links at most once to a given record. Merges either delete a
//! loser link (when the concept already links to the winner) or repoint it;
//! links are never left pointing at a record that no longer wins.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::confidence::Confidence;
use crate::record::{NormalizedId, NormalizedKind};

/// Identifier of an upstream concept (one extracted observation of one review).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConceptId(Uuid);

impl ConceptId {
    /// Creates a new random concept ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a concept ID from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConceptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConceptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ConceptId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// How a fragment was matched to its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedBy {
    /// Canonical key equal to an existing candidate's key.
    CanonicalKey,
    /// Oracle confirmed a match against a candidate.
    Oracle,
    /// Oracle named an id outside the candidate set; repaired by key or name.
    Repaired,
    /// The target key was retired by a merge and redirected to its winner.
    Alias,
    /// A new record was created for the fragment.
    Created,
    /// A new record was created after the oracle failed or could not be verified.
    Degraded,
    /// Another writer created the same key first; usage was incremented instead.
    Upsert,
}

impl MatchedBy {
    /// Returns true if the fragment produced a brand new record.
    #[must_use]
    pub const fn is_create(self) -> bool {
        matches!(self, Self::Created | Self::Degraded)
    }
}

impl fmt::Display for MatchedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CanonicalKey => "canonical_key",
            Self::Oracle => "oracle",
            Self::Repaired => "repaired",
            Self::Alias => "alias",
            Self::Created => "created",
            Self::Degraded => "degraded",
            Self::Upsert => "upsert",
        };
        f.write_str(s)
    }
}

/// A join row between a concept and a normalized record of one kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptLink {
    /// Catalog of the linked record.
    pub kind: NormalizedKind,

    /// The upstream concept.
    pub concept_id: ConceptId,

    /// The normalized record the concept resolves to.
    pub normalized_id: NormalizedId,

    /// Decision path that produced the link.
    pub matched_by: MatchedBy,

    /// Confidence of that decision.
    pub match_confidence: Confidence,

    /// The raw fragment as extracted.
    pub original_text: String,

    /// The fragment that accompanied it (the aspect of an entity, or vice versa).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_companion_text: Option<String>,

    /// When the link was written.
    pub created_at: DateTime<Utc>,
}

impl ConceptLink {
    /// Returns the uniqueness key of the link.
    #[must_use]
    pub const fn key(&self) -> (ConceptId, NormalizedId) {
        (self.concept_id, self.normalized_id)
    }
}

/// Result of writing a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkOutcome {
    /// A new row was written.
    Inserted,
    /// The concept already linked to the record; nothing changed.
    AlreadyLinked,
}
