//! In-memory storage backend.
//!
//! This module provides a thread-safe in-memory implementation of
//! `NormalizationStore`. It is intended for embedded usage, tests, and as the
//! reference implementation; the persistent backend wraps the same state.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::alias::AliasEdge;
use crate::concept::Concept;
use crate::link::{ConceptId, ConceptLink, LinkOutcome};
use crate::record::{NewRecord, NormalizedId, NormalizedKind, NormalizedRecord};
use crate::storage::changeset::{ChangeSet, Mutation, StoreSnapshot};
use crate::storage::traits::{
    ClusterMerge, MergeOutcome, NormalizationStore, StorageError, UpsertOutcome,
};

/// Maximum example surface forms kept on a record.
pub const MAX_EXAMPLES: usize = 10;

fn lock_err(context: &'static str) -> StorageError {
    StorageError::Backend(format!("poisoned lock: {context}"))
}

fn push_example(examples: &mut Vec<String>, example: &str) {
    let example = example.trim();
    if example.is_empty() || examples.len() >= MAX_EXAMPLES {
        return;
    }
    if examples.iter().any(|e| e.eq_ignore_ascii_case(example)) {
        return;
    }
    examples.push(example.to_string());
}

#[derive(Debug, Default, Clone)]
struct KindState {
    records: HashMap<NormalizedId, NormalizedRecord>,
    by_key: HashMap<String, NormalizedId>,
    links: HashMap<(ConceptId, NormalizedId), ConceptLink>,
    links_by_record: HashMap<NormalizedId, BTreeSet<ConceptId>>,
    aliases: HashMap<String, AliasEdge>,
}

impl KindState {
    fn record(&self, kind: NormalizedKind, id: NormalizedId) -> Result<&NormalizedRecord, StorageError> {
        self.records
            .get(&id)
            .ok_or(StorageError::RecordNotFound(kind, id))
    }

    fn linked_concepts(&self, id: NormalizedId) -> impl Iterator<Item = ConceptId> + '_ {
        self.links_by_record
            .get(&id)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }
}

/// Shared catalog state: validation produces change sets, `apply` commits them.
#[derive(Debug, Default, Clone)]
pub(crate) struct StoreState {
    entity: KindState,
    aspect: KindState,
    concepts: HashMap<ConceptId, Concept>,
}

impl StoreState {
    const fn kind(&self, kind: NormalizedKind) -> &KindState {
        match kind {
            NormalizedKind::Entity => &self.entity,
            NormalizedKind::Aspect => &self.aspect,
        }
    }

    fn kind_mut(&mut self, kind: NormalizedKind) -> &mut KindState {
        match kind {
            NormalizedKind::Entity => &mut self.entity,
            NormalizedKind::Aspect => &mut self.aspect,
        }
    }

    pub(crate) fn get_record(&self, kind: NormalizedKind, id: NormalizedId) -> Option<NormalizedRecord> {
        self.kind(kind).records.get(&id).cloned()
    }

    pub(crate) fn find_by_key(&self, kind: NormalizedKind, key: &str) -> Option<NormalizedRecord> {
        let state = self.kind(kind);
        state
            .by_key
            .get(key)
            .and_then(|id| state.records.get(id))
            .cloned()
    }

    pub(crate) fn list_active(&self, kind: NormalizedKind) -> Vec<NormalizedRecord> {
        let mut out: Vec<NormalizedRecord> = self
            .kind(kind)
            .records
            .values()
            .filter(|r| r.is_active)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.canonical_key.cmp(&b.canonical_key));
        out
    }

    pub(crate) fn links_for_record(&self, kind: NormalizedKind, id: NormalizedId) -> Vec<ConceptLink> {
        let state = self.kind(kind);
        state
            .linked_concepts(id)
            .filter_map(|c| state.links.get(&(c, id)).cloned())
            .collect()
    }

    pub(crate) fn links_for_concept(&self, kind: NormalizedKind, concept_id: ConceptId) -> Vec<ConceptLink> {
        let mut out: Vec<ConceptLink> = self
            .kind(kind)
            .links
            .values()
            .filter(|l| l.concept_id == concept_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.normalized_id.cmp(&b.normalized_id));
        out
    }

    pub(crate) fn get_concept(&self, id: ConceptId) -> Option<Concept> {
        self.concepts.get(&id).cloned()
    }

    pub(crate) fn get_alias(&self, kind: NormalizedKind, loser_key: &str) -> Option<AliasEdge> {
        self.kind(kind).aliases.get(loser_key).cloned()
    }

    pub(crate) fn plan_insert(&self, record: NormalizedRecord) -> Result<ChangeSet, StorageError> {
        let state = self.kind(record.kind);
        if record.canonical_key.trim().is_empty() {
            return Err(StorageError::ConstraintConflict(
                "canonical_key cannot be empty".to_string(),
            ));
        }
        if state.records.contains_key(&record.id) {
            return Err(StorageError::ConstraintConflict(format!(
                "{} id already exists: {}",
                record.kind, record.id
            )));
        }
        if state.by_key.contains_key(&record.canonical_key) {
            return Err(StorageError::ConstraintConflict(format!(
                "{} canonical_key already exists: {}",
                record.kind, record.canonical_key
            )));
        }
        let mut changes = ChangeSet::new();
        changes.push(Mutation::PutRecord(record));
        Ok(changes)
    }

    pub(crate) fn plan_upsert(
        &self,
        kind: NormalizedKind,
        new: NewRecord,
        now: DateTime<Utc>,
    ) -> Result<(ChangeSet, UpsertOutcome), StorageError> {
        if let Some(existing) = self.find_by_key(kind, &new.canonical_key) {
            if !existing.is_active {
                return Err(StorageError::ConstraintConflict(format!(
                    "{kind} canonical_key '{}' is held by inactive record {}",
                    existing.canonical_key, existing.id
                )));
            }
            let mut updated = existing;
            updated.usage_count = updated.usage_count.saturating_add(1);
            for example in &new.examples {
                push_example(&mut updated.examples, example);
            }
            updated.updated_at = now;
            let mut changes = ChangeSet::new();
            changes.push(Mutation::PutRecord(updated.clone()));
            return Ok((changes, UpsertOutcome::Incremented(updated)));
        }

        let mut record = NormalizedRecord::from_new(kind, new);
        record.created_at = now;
        record.updated_at = now;
        let changes = self.plan_insert(record.clone())?;
        Ok((changes, UpsertOutcome::Created(record)))
    }

    pub(crate) fn plan_increment(
        &self,
        kind: NormalizedKind,
        id: NormalizedId,
        by: u64,
        now: DateTime<Utc>,
    ) -> Result<(ChangeSet, NormalizedRecord), StorageError> {
        let mut record = self.kind(kind).record(kind, id)?.clone();
        if !record.is_active {
            return Err(StorageError::ConstraintConflict(format!(
                "{kind} record {id} is inactive; usage goes to its winner"
            )));
        }
        record.usage_count = record.usage_count.saturating_add(by);
        record.updated_at = now;
        let mut changes = ChangeSet::new();
        changes.push(Mutation::PutRecord(record.clone()));
        Ok((changes, record))
    }

    pub(crate) fn plan_link(&self, link: ConceptLink) -> Result<(ChangeSet, LinkOutcome), StorageError> {
        let state = self.kind(link.kind);
        let target = state.record(link.kind, link.normalized_id)?;
        if !target.is_active {
            return Err(StorageError::ConstraintConflict(format!(
                "cannot link concept {} to inactive {} record {}",
                link.concept_id, link.kind, link.normalized_id
            )));
        }
        if state.links.contains_key(&link.key()) {
            return Ok((ChangeSet::new(), LinkOutcome::AlreadyLinked));
        }
        let mut changes = ChangeSet::new();
        changes.push(Mutation::PutLink(link));
        Ok((changes, LinkOutcome::Inserted))
    }

    pub(crate) fn plan_set_concept(
        &self,
        id: ConceptId,
        kind: NormalizedKind,
        normalized_id: NormalizedId,
        version: &str,
        now: DateTime<Utc>,
    ) -> Result<(ChangeSet, Concept), StorageError> {
        self.kind(kind).record(kind, normalized_id)?;
        let mut concept = self
            .concepts
            .get(&id)
            .cloned()
            .unwrap_or_else(|| Concept::new(id));
        concept.set_normalized(kind, normalized_id);
        concept.normalization_version = Some(version.to_string());
        concept.updated_at = now;
        let mut changes = ChangeSet::new();
        changes.push(Mutation::PutConcept(concept.clone()));
        Ok((changes, concept))
    }

    /// Validates a cluster merge and plans its rewrite.
    ///
    /// Step order: collect winner concepts, drop loser links that would
    /// duplicate a winner link, repoint the rest, repoint concepts, deactivate
    /// losers, add the losers' usage to the winner once, then write aliases.
    pub(crate) fn plan_merge(
        &self,
        merge: &ClusterMerge,
        now: DateTime<Utc>,
    ) -> Result<(ChangeSet, MergeOutcome), StorageError> {
        let kind = merge.kind;
        let state = self.kind(kind);

        if merge.losers.is_empty() {
            return Err(StorageError::InvalidMerge("cluster has no losers".to_string()));
        }
        let mut distinct = HashSet::new();
        for loser in &merge.losers {
            if *loser == merge.winner {
                return Err(StorageError::InvalidMerge(format!(
                    "winner {} is listed as a loser",
                    merge.winner
                )));
            }
            if !distinct.insert(*loser) {
                return Err(StorageError::InvalidMerge(format!("loser {loser} listed twice")));
            }
        }

        let winner = state.record(kind, merge.winner)?;
        if !winner.is_active {
            return Err(StorageError::InvalidMerge(format!(
                "winner {} is no longer active",
                winner.id
            )));
        }
        let mut losers = Vec::with_capacity(merge.losers.len());
        for id in &merge.losers {
            let loser = state.record(kind, *id)?;
            if !loser.is_active {
                return Err(StorageError::InvalidMerge(format!(
                    "loser {} is no longer active",
                    loser.id
                )));
            }
            losers.push(loser);
        }

        let mut changes = ChangeSet::new();
        let mut outcome = MergeOutcome::default();

        let mut winner_concepts: HashSet<ConceptId> = state.linked_concepts(winner.id).collect();

        for loser in &losers {
            for concept_id in state.linked_concepts(loser.id) {
                let Some(link) = state.links.get(&(concept_id, loser.id)) else {
                    continue;
                };
                changes.push(Mutation::DeleteLink {
                    kind,
                    concept_id,
                    normalized_id: loser.id,
                });
                if winner_concepts.contains(&concept_id) {
                    outcome.removed_duplicate_links += 1;
                } else {
                    let mut moved = link.clone();
                    moved.normalized_id = winner.id;
                    changes.push(Mutation::PutLink(moved));
                    winner_concepts.insert(concept_id);
                    outcome.repointed_links += 1;
                }
            }
        }

        let mut concepts: Vec<&Concept> = self
            .concepts
            .values()
            .filter(|c| c.normalized(kind).is_some_and(|id| distinct.contains(&id)))
            .collect();
        concepts.sort_by_key(|c| c.id);
        for concept in concepts {
            let mut moved = concept.clone();
            moved.set_normalized(kind, winner.id);
            moved.updated_at = now;
            changes.push(Mutation::PutConcept(moved));
            outcome.repointed_concepts += 1;
        }

        let mut transferred = 0u64;
        for loser in &losers {
            let mut retired = (*loser).clone();
            retired.is_active = false;
            retired.updated_at = now;
            transferred = transferred.saturating_add(loser.usage_count);
            changes.push(Mutation::PutRecord(retired));
            outcome.deactivated += 1;
        }

        let mut survivor = winner.clone();
        survivor.usage_count = survivor.usage_count.saturating_add(transferred);
        for loser in &losers {
            push_example(&mut survivor.examples, &loser.display_name);
        }
        survivor.updated_at = now;
        outcome.usage_transferred = transferred;
        outcome.winner_usage_after = survivor.usage_count;
        changes.push(Mutation::PutRecord(survivor));

        let loser_keys: HashSet<&str> = losers.iter().map(|l| l.canonical_key.as_str()).collect();
        let mut rewritten: Vec<&AliasEdge> = state
            .aliases
            .values()
            .filter(|edge| loser_keys.contains(edge.winner_key.as_str()))
            .collect();
        rewritten.sort_by(|a, b| a.loser_key.cmp(&b.loser_key));
        for edge in rewritten {
            let mut edge = edge.clone();
            edge.winner_key.clone_from(&winner.canonical_key);
            changes.push(Mutation::PutAlias(edge));
            outcome.aliases_written += 1;
        }
        for loser in &losers {
            changes.push(Mutation::PutAlias(AliasEdge {
                kind,
                loser_key: loser.canonical_key.clone(),
                winner_key: winner.canonical_key.clone(),
                created_at: now,
            }));
            outcome.aliases_written += 1;
        }

        Ok((changes, outcome))
    }

    /// Commits a change set. Never fails; validation happened while planning.
    pub(crate) fn apply(&mut self, changes: &ChangeSet) {
        for mutation in &changes.mutations {
            match mutation {
                Mutation::PutRecord(record) => {
                    let state = self.kind_mut(record.kind);
                    state.by_key.insert(record.canonical_key.clone(), record.id);
                    state.records.insert(record.id, record.clone());
                }
                Mutation::PutLink(link) => {
                    let state = self.kind_mut(link.kind);
                    state
                        .links_by_record
                        .entry(link.normalized_id)
                        .or_default()
                        .insert(link.concept_id);
                    state.links.insert(link.key(), link.clone());
                }
                Mutation::DeleteLink {
                    kind,
                    concept_id,
                    normalized_id,
                } => {
                    let state = self.kind_mut(*kind);
                    state.links.remove(&(*concept_id, *normalized_id));
                    if let Some(set) = state.links_by_record.get_mut(normalized_id) {
                        set.remove(concept_id);
                        if set.is_empty() {
                            state.links_by_record.remove(normalized_id);
                        }
                    }
                }
                Mutation::PutConcept(concept) => {
                    self.concepts.insert(concept.id, concept.clone());
                }
                Mutation::PutAlias(edge) => {
                    self.kind_mut(edge.kind)
                        .aliases
                        .insert(edge.loser_key.clone(), edge.clone());
                }
            }
        }
    }

    /// Copies every row out, in a stable order.
    pub(crate) fn snapshot(&self) -> StoreSnapshot {
        let mut snapshot = StoreSnapshot::default();
        for kind in NormalizedKind::ALL {
            let state = self.kind(kind);
            let mut records: Vec<NormalizedRecord> = state.records.values().cloned().collect();
            records.sort_by_key(|r| r.id);
            snapshot.records.extend(records);

            let mut links: Vec<ConceptLink> = state.links.values().cloned().collect();
            links.sort_by_key(ConceptLink::key);
            snapshot.links.extend(links);

            let mut aliases: Vec<AliasEdge> = state.aliases.values().cloned().collect();
            aliases.sort_by(|a, b| a.loser_key.cmp(&b.loser_key));
            snapshot.aliases.extend(aliases);
        }
        let mut concepts: Vec<Concept> = self.concepts.values().cloned().collect();
        concepts.sort_by_key(|c| c.id);
        snapshot.concepts = concepts;
        snapshot
    }
}

/// Thread-safe in-memory normalization store.
#[derive(Debug, Default)]
pub struct InMemoryNormalizationStore {
    state: RwLock<StoreState>,
}

impl InMemoryNormalizationStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from a snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut state = StoreState::default();
        state.apply(&snapshot.into_change_set());
        Self {
            state: RwLock::new(state),
        }
    }

    /// Copy every row out of the store.
    ///
    /// # Errors
    /// Returns `Backend` if the lock is poisoned.
    pub fn snapshot(&self) -> Result<StoreSnapshot, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("store.snapshot"))?;
        Ok(state.snapshot())
    }
}

impl NormalizationStore for InMemoryNormalizationStore {
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
        let mut state = self.state.write().map_err(|_| lock_err("record.insert"))?;
        let changes = state.plan_insert(record)?;
        state.apply(&changes);
        Ok(())
    }

    fn upsert_record(
        &self,
        kind: NormalizedKind,
        new: NewRecord,
    ) -> Result<UpsertOutcome, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("record.upsert"))?;
        let (changes, outcome) = state.plan_upsert(kind, new, Utc::now())?;
        state.apply(&changes);
        Ok(outcome)
    }

    fn increment_usage(
        &self,
        kind: NormalizedKind,
        id: NormalizedId,
        by: u64,
    ) -> Result<NormalizedRecord, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("record.increment"))?;
        let (changes, record) = state.plan_increment(kind, id, by, Utc::now())?;
        state.apply(&changes);
        Ok(record)
    }

    fn link_concept(&self, link: ConceptLink) -> Result<LinkOutcome, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("link.insert"))?;
        let (changes, outcome) = state.plan_link(link)?;
        state.apply(&changes);
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
        let mut state = self.state.write().map_err(|_| lock_err("concept.set"))?;
        let (changes, concept) = state.plan_set_concept(id, kind, normalized_id, version, Utc::now())?;
        state.apply(&changes);
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
        let mut state = self.state.write().map_err(|_| lock_err("merge.apply"))?;
        let (changes, outcome) = state.plan_merge(merge, Utc::now())?;
        state.apply(&changes);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confidence::Confidence;
    use crate::link::MatchedBy;
    use crate::record::CreatedBy;

    fn new_record(key: &str) -> NewRecord {
        NewRecord {
            canonical_key: key.to_string(),
            display_name: key.replace('_', " "),
            description: String::new(),
            examples: vec![key.replace('_', " ")],
            confidence: Confidence::clamped(0.8),
            created_by: CreatedBy::Ai,
        }
    }

    fn seed(store: &InMemoryNormalizationStore, key: &str, usage: u64) -> NormalizedRecord {
        let mut record = NormalizedRecord::from_new(NormalizedKind::Entity, new_record(key));
        record.usage_count = usage;
        store.insert_record(record.clone()).unwrap();
        record
    }

    fn link(store: &InMemoryNormalizationStore, concept_id: ConceptId, id: NormalizedId) {
        store
            .link_concept(ConceptLink {
                kind: NormalizedKind::Entity,
                concept_id,
                normalized_id: id,
                matched_by: MatchedBy::Created,
                match_confidence: Confidence::clamped(0.8),
                original_text: "x".to_string(),
                original_companion_text: None,
                created_at: Utc::now(),
            })
            .unwrap();
    }

    #[test]
    fn test_insert_rejects_duplicate_key() {
        let store = InMemoryNormalizationStore::new();
        seed(&store, "helado", 1);
        let dup = NormalizedRecord::from_new(NormalizedKind::Entity, new_record("helado"));
        assert!(matches!(
            store.insert_record(dup),
            Err(StorageError::ConstraintConflict(_))
        ));

        // Same key in the other kind is fine.
        let aspect = NormalizedRecord::from_new(NormalizedKind::Aspect, new_record("helado"));
        assert!(store.insert_record(aspect).is_ok());
    }

    #[test]
    fn test_upsert_creates_then_increments() {
        let store = InMemoryNormalizationStore::new();
        let first = store
            .upsert_record(NormalizedKind::Aspect, new_record("sabor"))
            .unwrap();
        assert!(matches!(first, UpsertOutcome::Created(_)));

        let mut again = new_record("sabor");
        again.examples = vec!["Sabores".to_string()];
        let second = store.upsert_record(NormalizedKind::Aspect, again).unwrap();
        let UpsertOutcome::Incremented(record) = second else {
            panic!("expected increment");
        };
        assert_eq!(record.id, first.record().id);
        assert_eq!(record.usage_count, 2);
        assert_eq!(record.examples, vec!["sabor".to_string(), "Sabores".to_string()]);
    }

    #[test]
    fn test_upsert_rejects_key_of_inactive_record() {
        let store = InMemoryNormalizationStore::new();
        let winner = seed(&store, "personal", 5);
        let loser = seed(&store, "dependiente", 1);
        store
            .apply_merge(&ClusterMerge {
                kind: NormalizedKind::Entity,
                winner: winner.id,
                losers: vec![loser.id],
            })
            .unwrap();
        let err = store
            .upsert_record(NormalizedKind::Entity, new_record("dependiente"))
            .unwrap_err();
        assert!(matches!(err, StorageError::ConstraintConflict(_)));
    }

    #[test]
    fn test_link_is_unique_per_pair() {
        let store = InMemoryNormalizationStore::new();
        let record = seed(&store, "helado", 1);
        let concept = ConceptId::new();
        link(&store, concept, record.id);
        let again = store
            .link_concept(ConceptLink {
                kind: NormalizedKind::Entity,
                concept_id: concept,
                normalized_id: record.id,
                matched_by: MatchedBy::Oracle,
                match_confidence: Confidence::clamped(0.9),
                original_text: "helados".to_string(),
                original_companion_text: None,
                created_at: Utc::now(),
            })
            .unwrap();
        assert_eq!(again, LinkOutcome::AlreadyLinked);
        assert_eq!(store.links_for_record(NormalizedKind::Entity, record.id).unwrap().len(), 1);
    }

    #[test]
    fn test_link_requires_existing_active_record() {
        let store = InMemoryNormalizationStore::new();
        let missing = NormalizedId::new();
        let err = store
            .link_concept(ConceptLink {
                kind: NormalizedKind::Entity,
                concept_id: ConceptId::new(),
                normalized_id: missing,
                matched_by: MatchedBy::Created,
                match_confidence: Confidence::clamped(0.5),
                original_text: "x".to_string(),
                original_companion_text: None,
                created_at: Utc::now(),
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::RecordNotFound(_, id) if id == missing));
    }

    #[test]
    fn test_merge_dedupes_and_repoints_links() {
        let store = InMemoryNormalizationStore::new();
        let winner = seed(&store, "helado_chocolate", 5);
        let loser_a = seed(&store, "helado_de_chocolate", 2);
        let loser_b = seed(&store, "helados_chocolate", 1);

        let shared = ConceptId::new();
        let only_a = ConceptId::new();
        let a_and_b = ConceptId::new();
        link(&store, shared, winner.id);
        link(&store, shared, loser_a.id);
        link(&store, only_a, loser_a.id);
        link(&store, a_and_b, loser_a.id);
        link(&store, a_and_b, loser_b.id);
        store
            .set_concept_normalized(only_a, NormalizedKind::Entity, loser_a.id, "v1")
            .unwrap();

        let outcome = store
            .apply_merge(&ClusterMerge {
                kind: NormalizedKind::Entity,
                winner: winner.id,
                losers: vec![loser_a.id, loser_b.id],
            })
            .unwrap();

        assert_eq!(outcome.repointed_links, 2);
        assert_eq!(outcome.removed_duplicate_links, 2);
        assert_eq!(outcome.repointed_concepts, 1);
        assert_eq!(outcome.deactivated, 2);
        assert_eq!(outcome.usage_transferred, 3);
        assert_eq!(outcome.winner_usage_after, 8);
        assert_eq!(outcome.aliases_written, 2);

        let links = store.links_for_record(NormalizedKind::Entity, winner.id).unwrap();
        let mut concepts: Vec<ConceptId> = links.iter().map(|l| l.concept_id).collect();
        concepts.sort();
        let mut expected = vec![shared, only_a, a_and_b];
        expected.sort();
        assert_eq!(concepts, expected);
        assert!(store.links_for_record(NormalizedKind::Entity, loser_a.id).unwrap().is_empty());
        assert!(store.links_for_record(NormalizedKind::Entity, loser_b.id).unwrap().is_empty());

        let concept = store.get_concept(only_a).unwrap().unwrap();
        assert_eq!(concept.normalized_entity_id, Some(winner.id));

        let retired = store.get_record(NormalizedKind::Entity, loser_a.id).unwrap().unwrap();
        assert!(!retired.is_active);
        assert_eq!(retired.canonical_key, "helado_de_chocolate");
        assert_eq!(store.list_active(NormalizedKind::Entity).unwrap().len(), 1);
    }

    #[test]
    fn test_merge_is_atomic_on_invalid_cluster() {
        let store = InMemoryNormalizationStore::new();
        let winner = seed(&store, "personal", 5);
        let loser = seed(&store, "dependiente", 1);
        let before = store.snapshot().unwrap();

        let err = store
            .apply_merge(&ClusterMerge {
                kind: NormalizedKind::Entity,
                winner: winner.id,
                losers: vec![loser.id, NormalizedId::new()],
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::RecordNotFound(..)));
        assert_eq!(store.snapshot().unwrap(), before);

        let err = store
            .apply_merge(&ClusterMerge {
                kind: NormalizedKind::Entity,
                winner: winner.id,
                losers: vec![winner.id],
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidMerge(_)));
    }

    #[test]
    fn test_snapshot_roundtrip_rebuilds_indexes() {
        let store = InMemoryNormalizationStore::new();
        let record = seed(&store, "terraza", 3);
        let concept = ConceptId::new();
        link(&store, concept, record.id);

        let rebuilt = InMemoryNormalizationStore::from_snapshot(store.snapshot().unwrap());
        assert_eq!(
            rebuilt.find_by_key(NormalizedKind::Entity, "terraza").unwrap().unwrap().id,
            record.id
        );
        assert_eq!(rebuilt.links_for_concept(NormalizedKind::Entity, concept).unwrap().len(), 1);
    }
}
