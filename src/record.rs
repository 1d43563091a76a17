//! Normalized records: the canonical, reusable entities and aspects.
//!
//! A record is created the first time a semantically new fragment is seen,
//! accumulates usage on every later match, and is never deleted. Losing a
//! merge flips `is_active` to false while the record keeps its historical key.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::confidence::Confidence;

/// Stable identifier of a normalized record.
///
/// Ordered so that it can serve as the final tie-break of winner selection.
///
/// # Examples
///
/// ```
/// use kyronorm::NormalizedId;
///
/// let id = NormalizedId::new();
/// assert!(!id.is_nil());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedId(Uuid);

impl NormalizedId {
    /// Creates a new random record ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a record ID from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Returns true if this is a nil (all zeros) UUID.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Creates a nil record ID (for testing or sentinel values).
    #[must_use]
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Parses an ID from the textual form an oracle echoes back.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s.trim()).ok().map(Self)
    }
}

impl Default for NormalizedId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NormalizedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for NormalizedId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Which catalog a record belongs to. Each kind has its own record, link and
/// alias tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizedKind {
    /// Who or what the review talks about ("dependiente", "helado").
    Entity,
    /// The quality being judged ("amabilidad", "sabor").
    Aspect,
}

impl NormalizedKind {
    /// Both kinds, in storage order.
    pub const ALL: [Self; 2] = [Self::Entity, Self::Aspect];

    /// Returns the lowercase name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Entity => "entity",
            Self::Aspect => "aspect",
        }
    }
}

impl fmt::Display for NormalizedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NormalizedKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("entity") {
            Ok(Self::Entity)
        } else if s.eq_ignore_ascii_case("aspect") {
            Ok(Self::Aspect)
        } else {
            Err(format!("unknown normalized kind: {s} (expected entity or aspect)"))
        }
    }
}

/// Who created a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatedBy {
    /// Created from an oracle decision (or its degraded fallback).
    Ai,
    /// Created by a named operator or import job.
    Other(String),
}

impl Default for CreatedBy {
    fn default() -> Self {
        Self::Ai
    }
}

impl fmt::Display for CreatedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ai => f.write_str("ai"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

/// A canonical entity or aspect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    /// Stable identifier.
    pub id: NormalizedId,

    /// Catalog this record lives in.
    pub kind: NormalizedKind,

    /// Unique bucket key. Kept by inactive records for audit.
    pub canonical_key: String,

    /// Human-readable name.
    pub display_name: String,

    /// Short description of what the record stands for.
    #[serde(default)]
    pub description: String,

    /// Example surface forms, oldest first.
    #[serde(default)]
    pub examples: Vec<String>,

    /// Confidence of the decision that created the record.
    pub confidence: Confidence,

    /// Number of fragments resolved to this record.
    pub usage_count: u64,

    /// False once the record lost a merge.
    pub is_active: bool,

    /// Creator of the record.
    #[serde(default)]
    pub created_by: CreatedBy,

    /// When the record was first created.
    pub created_at: DateTime<Utc>,

    /// When the record was last modified.
    pub updated_at: DateTime<Utc>,
}

impl NormalizedRecord {
    /// Builds an active record from a creation proposal with a usage of one.
    #[must_use]
    pub fn from_new(kind: NormalizedKind, new: NewRecord) -> Self {
        let now = Utc::now();
        Self {
            id: NormalizedId::new(),
            kind,
            canonical_key: new.canonical_key,
            display_name: new.display_name,
            description: new.description,
            examples: new.examples,
            confidence: new.confidence,
            usage_count: 1,
            is_active: true,
            created_by: new.created_by,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the view of this record handed to the oracle.
    #[must_use]
    pub fn to_candidate(&self) -> CandidateRecord {
        CandidateRecord {
            id: self.id,
            canonical_key: self.canonical_key.clone(),
            display_name: self.display_name.clone(),
            description: self.description.clone(),
            examples: self.examples.clone(),
        }
    }
}

/// Proposal for a record that does not exist yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub canonical_key: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub examples: Vec<String>,
    pub confidence: Confidence,
    #[serde(default)]
    pub created_by: CreatedBy,
}

/// The subset of a record shown to the oracle in classify-one mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub id: NormalizedId,
    pub canonical_key: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub examples: Vec<String>,
}
