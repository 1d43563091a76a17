//! Change sets: the unit of atomic mutation shared by every backend.
//!
//! Backends validate a request against current state and produce a
//! `ChangeSet` of plain row writes. Applying a change set cannot fail, so the
//! persistent backend can log it first and apply it second, and replay is a
//! straight re-application of logged change sets.

use serde::{Deserialize, Serialize};

use crate::alias::AliasEdge;
use crate::concept::Concept;
use crate::link::{ConceptId, ConceptLink};
use crate::record::{NormalizedId, NormalizedKind, NormalizedRecord};

/// A single row write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// Insert or replace a record (keyed by kind and id).
    PutRecord(NormalizedRecord),
    /// Insert or replace a link (keyed by kind, concept and record).
    PutLink(ConceptLink),
    /// Remove a link.
    DeleteLink {
        kind: NormalizedKind,
        concept_id: ConceptId,
        normalized_id: NormalizedId,
    },
    /// Insert or replace a concept's normalization state.
    PutConcept(Concept),
    /// Insert or replace an alias edge (keyed by kind and loser key).
    PutAlias(AliasEdge),
}

/// An ordered list of row writes applied as one unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub mutations: Vec<Mutation>,
}

impl ChangeSet {
    /// Creates an empty change set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mutations: Vec::new(),
        }
    }

    /// Appends a write.
    pub fn push(&mut self, mutation: Mutation) {
        self.mutations.push(mutation);
    }

    /// Returns true if there is nothing to apply.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Number of writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mutations.len()
    }
}

/// A full copy of the store, used by compaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub records: Vec<NormalizedRecord>,
    pub links: Vec<ConceptLink>,
    pub concepts: Vec<Concept>,
    pub aliases: Vec<AliasEdge>,
}

impl StoreSnapshot {
    /// Number of rows in the snapshot.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.records.len() + self.links.len() + self.concepts.len() + self.aliases.len()
    }

    /// Converts the snapshot into a change set that rebuilds it.
    #[must_use]
    pub fn into_change_set(self) -> ChangeSet {
        let mut changes = ChangeSet::new();
        changes
            .mutations
            .extend(self.records.into_iter().map(Mutation::PutRecord));
        changes
            .mutations
            .extend(self.links.into_iter().map(Mutation::PutLink));
        changes
            .mutations
            .extend(self.concepts.into_iter().map(Mutation::PutConcept));
        changes
            .mutations
            .extend(self.aliases.into_iter().map(Mutation::PutAlias));
        changes
    }
}
