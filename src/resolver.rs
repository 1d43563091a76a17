//! Single-fragment resolution: match an existing record or create one.
//!
//! Decision order:
//! 1. The fragment's canonical key equals a candidate's key: deterministic
//!    match, no oracle call.
//! 2. The oracle classifies the fragment against the candidates. Its answer
//!    is validated; a match on an id that was not offered is repaired by key
//!    or name, or else rejected.
//! 3. Any oracle failure (transport, timeout, malformed or unverifiable
//!    answer) degrades to a create from the raw text at reduced confidence.
//! 4. A create whose key was retired by a merge becomes a match against the
//!    merge's winner.
//! 5. The create is an upsert, so a concurrent writer that created the same
//!    key first turns this create into a usage increment.
//!
//! Nothing is written before the final decision is known.

use tracing::{debug, info, warn};

use crate::alias::AliasResolver;
use crate::confidence::Confidence;
use crate::config::NormalizerConfig;
use crate::error::{ExecutionError, NormError, NormResult, ValidationError};
use crate::keyer::canonical_key;
use crate::link::MatchedBy;
use crate::oracle::{validate_classify_one, ClassifyOneRequest, OneDecision};
use crate::record::{CandidateRecord, CreatedBy, NewRecord, NormalizedId, NormalizedKind, NormalizedRecord};
use crate::runtime::OraclePool;
use crate::storage::{NormalizationStore, StorageError, UpsertOutcome};

/// Builds a classify-one candidate list: active records, most used first,
/// at most `limit` of them.
///
/// # Errors
/// Propagates storage errors.
pub fn candidate_list(
    store: &dyn NormalizationStore,
    kind: NormalizedKind,
    limit: usize,
) -> Result<Vec<CandidateRecord>, StorageError> {
    let mut active = store.list_active(kind)?;
    active.sort_by(|a, b| {
        b.usage_count
            .cmp(&a.usage_count)
            .then_with(|| a.canonical_key.cmp(&b.canonical_key))
    });
    Ok(active.iter().take(limit).map(NormalizedRecord::to_candidate).collect())
}

/// One fragment to resolve.
#[derive(Debug, Clone, Copy)]
pub struct Fragment<'a> {
    pub kind: NormalizedKind,
    /// Raw text as extracted.
    pub text: &'a str,
    /// Text of the other kind from the same concept, if any.
    pub companion: Option<&'a str>,
}

impl<'a> Fragment<'a> {
    /// Creates a fragment without companion context.
    #[must_use]
    pub const fn new(kind: NormalizedKind, text: &'a str) -> Self {
        Self {
            kind,
            text,
            companion: None,
        }
    }

    /// Adds companion context.
    #[must_use]
    pub const fn with_companion(mut self, companion: Option<&'a str>) -> Self {
        self.companion = companion;
        self
    }
}

/// Final decision for one fragment, after it was persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// The record the fragment now resolves to, as stored after the write.
    pub record: NormalizedRecord,
    pub matched_by: MatchedBy,
    pub confidence: Confidence,
    /// Canonical key of the fragment text.
    pub fragment_key: String,
}

impl Resolution {
    /// Returns the id of the resolved record.
    #[must_use]
    pub const fn id(&self) -> NormalizedId {
        self.record.id
    }

    /// Returns true if the fragment created a new record.
    #[must_use]
    pub const fn created(&self) -> bool {
        self.matched_by.is_create()
    }
}

/// Resolves fragments against one store through one oracle pool.
pub struct SingleItemResolver<'a> {
    store: &'a dyn NormalizationStore,
    pool: &'a OraclePool,
    config: &'a NormalizerConfig,
}

impl<'a> SingleItemResolver<'a> {
    /// Creates a resolver.
    #[must_use]
    pub fn new(store: &'a dyn NormalizationStore, pool: &'a OraclePool, config: &'a NormalizerConfig) -> Self {
        Self { store, pool, config }
    }

    /// Resolves a fragment against a bounded candidate list and persists the
    /// decision.
    ///
    /// # Errors
    /// - `Validation(EmptyFragment)` if the text has nothing to key
    /// - `Storage(..)` if the write fails
    ///
    /// Oracle failures never surface; they degrade to a create.
    pub fn resolve(&self, fragment: Fragment<'_>, candidates: &[CandidateRecord]) -> NormResult<Resolution> {
        let kind = fragment.kind;
        let key = canonical_key(fragment.text);
        if key.is_empty() {
            return Err(ValidationError::EmptyFragment.into());
        }

        if let Some(hit) = candidates.iter().find(|c| c.canonical_key == key) {
            debug!(kind = %kind, key = %key, id = %hit.id, "canonical key fast path");
            return self.settle_match(kind, hit.id, MatchedBy::CanonicalKey, self.config.exact_match(), key);
        }

        let request = ClassifyOneRequest {
            fragment_text: fragment.text.trim().to_string(),
            companion_context: fragment.companion.map(|c| c.trim().to_string()).filter(|c| !c.is_empty()),
            candidates: candidates.to_vec(),
        };
        let decision = self.pool.classify_one(request).and_then(|raw| {
            validate_classify_one(&raw, candidates, self.config.default_oracle_confidence()).map_err(NormError::from)
        });

        match decision {
            Ok(OneDecision::Match { id, confidence }) => {
                self.settle_match(kind, id, MatchedBy::Oracle, confidence, key)
            }
            Ok(OneDecision::Repaired { id, confidence, claimed }) => {
                info!(kind = %kind, claimed = %claimed, id = %id, "oracle match repaired");
                self.settle_match(kind, id, MatchedBy::Repaired, confidence, key)
            }
            Ok(OneDecision::Create(proposal)) => {
                // The fragment's own key wins whenever the proposal agrees with it,
                // so later fragments of the same text take the fast path.
                let record_key = if canonical_key(&proposal.canonical_key) == key
                    || canonical_key(&proposal.display_name) == key
                {
                    key.clone()
                } else {
                    proposal.canonical_key
                };
                if let Some(hit) = candidates.iter().find(|c| c.canonical_key == record_key) {
                    debug!(kind = %kind, key = %record_key, "oracle create collides with a candidate key");
                    return self.settle_match(kind, hit.id, MatchedBy::CanonicalKey, proposal.confidence, key);
                }
                let confidence = proposal.confidence;
                let new = NewRecord {
                    canonical_key: record_key,
                    display_name: proposal.display_name,
                    description: proposal.description,
                    examples: proposal.examples,
                    confidence,
                    created_by: CreatedBy::Ai,
                };
                self.create(kind, new, MatchedBy::Created, key)
            }
            Err(err) => {
                warn!(kind = %kind, fragment = %fragment.text, error = %err, "oracle failed; degrading to create");
                let display_name = fragment.text.trim().to_string();
                let new = NewRecord {
                    canonical_key: key.clone(),
                    examples: vec![display_name.clone()],
                    display_name,
                    description: String::new(),
                    confidence: self.config.degraded(),
                    created_by: CreatedBy::Ai,
                };
                self.create(kind, new, MatchedBy::Degraded, key)
            }
        }
    }

    /// Credits a match to a record, following its alias if it was merged
    /// away since the candidate list was built.
    fn settle_match(
        &self,
        kind: NormalizedKind,
        id: NormalizedId,
        matched_by: MatchedBy,
        confidence: Confidence,
        fragment_key: String,
    ) -> NormResult<Resolution> {
        match self.store.increment_usage(kind, id, 1) {
            Ok(record) => Ok(Resolution {
                record,
                matched_by,
                confidence,
                fragment_key,
            }),
            Err(StorageError::ConstraintConflict(reason)) => {
                let retired = self
                    .store
                    .get_record(kind, id)?
                    .ok_or(ExecutionError::RecordNotFound { kind, id })?;
                debug!(kind = %kind, id = %id, reason = %reason, "matched record was merged away");
                self.credit_alias(kind, &retired.canonical_key, confidence, fragment_key)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn credit_alias(
        &self,
        kind: NormalizedKind,
        retired_key: &str,
        confidence: Confidence,
        fragment_key: String,
    ) -> NormResult<Resolution> {
        let target = AliasResolver::new(self.store).resolve(kind, retired_key)?.ok_or_else(|| {
            NormError::from(StorageError::ConstraintConflict(format!(
                "{kind} key '{retired_key}' is retired and has no active alias target"
            )))
        })?;
        let record = self.store.increment_usage(kind, target.record.id, 1)?;
        Ok(Resolution {
            record,
            matched_by: MatchedBy::Alias,
            confidence,
            fragment_key,
        })
    }

    fn create(
        &self,
        kind: NormalizedKind,
        new: NewRecord,
        matched_by: MatchedBy,
        fragment_key: String,
    ) -> NormResult<Resolution> {
        let confidence = new.confidence;
        let aliases = AliasResolver::new(self.store);
        if let Some(target) = aliases.redirect(kind, &new.canonical_key)? {
            debug!(
                kind = %kind,
                key = %new.canonical_key,
                winner = %target.record.canonical_key,
                hops = target.hops,
                "create redirected by alias"
            );
            let record = self.store.increment_usage(kind, target.record.id, 1)?;
            return Ok(Resolution {
                record,
                matched_by: MatchedBy::Alias,
                confidence,
                fragment_key,
            });
        }

        let key = new.canonical_key.clone();
        match self.store.upsert_record(kind, new) {
            Ok(UpsertOutcome::Created(record)) => {
                info!(kind = %kind, key = %record.canonical_key, id = %record.id, matched_by = %matched_by, "record created");
                Ok(Resolution {
                    record,
                    matched_by,
                    confidence,
                    fragment_key,
                })
            }
            Ok(UpsertOutcome::Incremented(record)) => Ok(Resolution {
                record,
                matched_by: MatchedBy::Upsert,
                confidence,
                fragment_key,
            }),
            // Merged between the alias check and the upsert.
            Err(StorageError::ConstraintConflict(_)) => self.credit_alias(kind, &key, confidence, fragment_key),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::{json, Value};

    use crate::error::OracleError;
    use crate::oracle::{ClassifyManyRequest, SemanticOracle};
    use crate::storage::{ClusterMerge, InMemoryNormalizationStore};

    /// Answers every classify-one call with a fixed value.
    struct Scripted(Result<Value, String>);

    impl SemanticOracle for Scripted {
        fn classify_one(&self, _: &ClassifyOneRequest) -> Result<Value, OracleError> {
            self.0.clone().map_err(OracleError::transport)
        }

        fn classify_many(&self, _: &ClassifyManyRequest) -> Result<Value, OracleError> {
            Err(OracleError::transport("unused"))
        }
    }

    fn pool(answer: Result<Value, String>) -> OraclePool {
        OraclePool::start(Arc::new(Scripted(answer)), 1, 4, std::time::Duration::from_secs(5)).unwrap()
    }

    fn seed(store: &InMemoryNormalizationStore, key: &str, name: &str) -> NormalizedRecord {
        store
            .upsert_record(
                NormalizedKind::Entity,
                NewRecord {
                    canonical_key: key.to_string(),
                    display_name: name.to_string(),
                    description: String::new(),
                    examples: Vec::new(),
                    confidence: Confidence::clamped(0.9),
                    created_by: CreatedBy::Ai,
                },
            )
            .unwrap()
            .into_record()
    }

    fn entity(text: &str) -> Fragment<'_> {
        Fragment::new(NormalizedKind::Entity, text)
    }

    #[test]
    fn test_fast_path_skips_oracle() {
        let store = InMemoryNormalizationStore::new();
        let helado = seed(&store, "helado_chocolate", "Helado de chocolate");
        // The oracle would fail; the fast path never asks it.
        let pool = pool(Err("down".to_string()));
        let config = NormalizerConfig::default();
        let resolver = SingleItemResolver::new(&store, &pool, &config);

        let res = resolver
            .resolve(entity("los helados de chocolate"), &[helado.to_candidate()])
            .unwrap();
        assert_eq!(res.id(), helado.id);
        assert_eq!(res.matched_by, MatchedBy::CanonicalKey);
        assert!((res.confidence.value() - 0.95).abs() < f32::EPSILON);
        assert_eq!(res.record.usage_count, 2);
    }

    #[test]
    fn test_empty_fragment_rejected() {
        let store = InMemoryNormalizationStore::new();
        let pool = pool(Ok(json!({})));
        let config = NormalizerConfig::default();
        let resolver = SingleItemResolver::new(&store, &pool, &config);
        let err = resolver.resolve(entity(" ¡! "), &[]).unwrap_err();
        assert!(matches!(err, NormError::Validation(ValidationError::EmptyFragment)));
    }

    #[test]
    fn test_oracle_create() {
        let store = InMemoryNormalizationStore::new();
        let pool = pool(Ok(json!({
            "action": "create",
            "canonical_key": "terraza",
            "display_name": "Terraza",
            "description": "Outdoor seating",
            "examples": ["la terraza"],
            "confidence": 0.8
        })));
        let config = NormalizerConfig::default();
        let resolver = SingleItemResolver::new(&store, &pool, &config);

        let res = resolver.resolve(entity("la terraza"), &[]).unwrap();
        assert!(res.created());
        assert_eq!(res.matched_by, MatchedBy::Created);
        assert_eq!(res.record.display_name, "Terraza");
        assert_eq!(res.record.usage_count, 1);
        assert!(store.find_by_key(NormalizedKind::Entity, "terraza").unwrap().is_some());
    }

    #[test]
    fn test_transport_failure_degrades() {
        let store = InMemoryNormalizationStore::new();
        let pool = pool(Err("connection reset".to_string()));
        let config = NormalizerConfig::default();
        let resolver = SingleItemResolver::new(&store, &pool, &config);

        let res = resolver.resolve(entity("  Música alta "), &[]).unwrap();
        assert_eq!(res.matched_by, MatchedBy::Degraded);
        assert_eq!(res.record.display_name, "Música alta");
        assert_eq!(res.record.canonical_key, "musica_alta");
        assert!(res.confidence.value() <= 0.6);
    }

    #[test]
    fn test_create_of_retired_key_follows_alias() {
        let store = InMemoryNormalizationStore::new();
        let winner = seed(&store, "personal", "Personal");
        let loser = seed(&store, "dependiente", "Dependiente");
        store
            .apply_merge(&ClusterMerge {
                kind: NormalizedKind::Entity,
                winner: winner.id,
                losers: vec![loser.id],
            })
            .unwrap();

        let pool = pool(Ok(json!({"action": "create", "display_name": "Dependiente"})));
        let config = NormalizerConfig::default();
        let resolver = SingleItemResolver::new(&store, &pool, &config);

        let res = resolver.resolve(entity("dependientes"), &[]).unwrap();
        assert_eq!(res.matched_by, MatchedBy::Alias);
        assert_eq!(res.id(), winner.id);
        assert_eq!(res.record.usage_count, 3);
        assert_eq!(store.list_active(NormalizedKind::Entity).unwrap().len(), 1);
    }

    #[test]
    fn test_match_on_merged_candidate_credits_winner() {
        let store = InMemoryNormalizationStore::new();
        let winner = seed(&store, "personal", "Personal");
        let loser = seed(&store, "camarero", "Camarero");
        let stale = vec![loser.to_candidate()];
        store
            .apply_merge(&ClusterMerge {
                kind: NormalizedKind::Entity,
                winner: winner.id,
                losers: vec![loser.id],
            })
            .unwrap();

        let pool = pool(Ok(json!({"action": "match", "normalized_id": loser.id.to_string(), "confidence": 0.85})));
        let config = NormalizerConfig::default();
        let resolver = SingleItemResolver::new(&store, &pool, &config);

        let res = resolver.resolve(entity("mesero"), &stale).unwrap();
        assert_eq!(res.id(), winner.id);
        assert_eq!(res.matched_by, MatchedBy::Alias);
    }

    #[test]
    fn test_candidate_list_ranks_by_usage() {
        let store = InMemoryNormalizationStore::new();
        seed(&store, "terraza", "Terraza");
        let personal = seed(&store, "personal", "Personal");
        store.increment_usage(NormalizedKind::Entity, personal.id, 4).unwrap();
        seed(&store, "cafe", "Café");

        let list = candidate_list(&store, NormalizedKind::Entity, 2).unwrap();
        let keys: Vec<&str> = list.iter().map(|c| c.canonical_key.as_str()).collect();
        assert_eq!(keys, vec!["personal", "cafe"]);
    }

    #[test]
    fn test_existing_key_becomes_upsert() {
        let store = InMemoryNormalizationStore::new();
        seed(&store, "terraza", "Terraza");
        // Not offered as a candidate, so the oracle proposes a create of the same key.
        let pool = pool(Ok(json!({"action": "create", "canonical_key": "terraza", "display_name": "Terraza"})));
        let config = NormalizerConfig::default();
        let resolver = SingleItemResolver::new(&store, &pool, &config);

        let res = resolver.resolve(entity("terrazas"), &[]).unwrap();
        assert_eq!(res.matched_by, MatchedBy::Upsert);
        assert_eq!(res.record.usage_count, 2);
        assert!(!res.created());
    }
}
