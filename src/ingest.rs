//! Upstream ingestion: normalizes the entity and aspect of extracted triples.
//!
//! For every fragment of a triple the ingestor resolves a record, links the
//! concept to it and points the concept at it with the current
//! normalization version. A failing fragment is reported in its triple's
//! outcome; it never stops the batch.

use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::concept::ConceptTriple;
use crate::confidence::Confidence;
use crate::config::NormalizerConfig;
use crate::error::NormResult;
use crate::link::{ConceptId, ConceptLink, LinkOutcome, MatchedBy};
use crate::record::{CandidateRecord, NormalizedId, NormalizedKind};
use crate::resolver::{candidate_list, Fragment, SingleItemResolver};
use crate::runtime::{duration_ms, OraclePool};
use crate::storage::NormalizationStore;

/// How one fragment of a triple was normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentOutcome {
    pub normalized_id: NormalizedId,
    pub canonical_key: String,
    pub matched_by: MatchedBy,
    pub confidence: Confidence,
    pub link: LinkOutcome,
}

/// A fragment that could not be normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentFailure {
    pub kind: NormalizedKind,
    pub error: String,
    pub retryable: bool,
}

/// Per-triple result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripleOutcome {
    pub concept_id: ConceptId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<FragmentOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect: Option<FragmentOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FragmentFailure>,
}

impl TripleOutcome {
    fn new(concept_id: ConceptId) -> Self {
        Self {
            concept_id,
            entity: None,
            aspect: None,
            failures: Vec::new(),
        }
    }

    /// Returns the outcome of one kind.
    #[must_use]
    pub const fn fragment(&self, kind: NormalizedKind) -> Option<&FragmentOutcome> {
        match kind {
            NormalizedKind::Entity => self.entity.as_ref(),
            NormalizedKind::Aspect => self.aspect.as_ref(),
        }
    }

    fn set(&mut self, kind: NormalizedKind, outcome: FragmentOutcome) {
        match kind {
            NormalizedKind::Entity => self.entity = Some(outcome),
            NormalizedKind::Aspect => self.aspect = Some(outcome),
        }
    }
}

/// Summary of one ingested batch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IngestReport {
    pub outcomes: Vec<TripleOutcome>,
    /// Fragments that created a new record.
    pub created: usize,
    /// Fragments matched to an existing record.
    pub matched: usize,
    /// Fragments created after an oracle failure.
    pub degraded: usize,
    /// Fragments that could not be normalized.
    pub failed: usize,
}

impl IngestReport {
    fn count(&mut self, outcome: &FragmentOutcome) {
        match outcome.matched_by {
            MatchedBy::Created => self.created += 1,
            MatchedBy::Degraded => {
                self.created += 1;
                self.degraded += 1;
            }
            _ => self.matched += 1,
        }
    }
}

/// Normalizes batches of upstream triples.
pub struct Ingestor<'a> {
    store: &'a dyn NormalizationStore,
    resolver: SingleItemResolver<'a>,
    config: &'a NormalizerConfig,
}

impl<'a> Ingestor<'a> {
    /// Creates an ingestor.
    #[must_use]
    pub fn new(store: &'a dyn NormalizationStore, pool: &'a OraclePool, config: &'a NormalizerConfig) -> Self {
        Self {
            store,
            resolver: SingleItemResolver::new(store, pool, config),
            config,
        }
    }

    /// Ingests a batch of triples.
    ///
    /// Candidate lists are read once per batch and extended with the records
    /// the batch creates, so later fragments can match earlier ones.
    ///
    /// # Errors
    /// Only a failure to read the initial candidate lists surfaces.
    pub fn ingest_batch(&self, triples: &[ConceptTriple]) -> NormResult<IngestReport> {
        let started = Instant::now();
        let limit = self.config.max_candidates;
        let mut entity_candidates = candidate_list(self.store, NormalizedKind::Entity, limit)?;
        let mut aspect_candidates = candidate_list(self.store, NormalizedKind::Aspect, limit)?;

        let mut report = IngestReport::default();
        for triple in triples {
            let mut outcome = TripleOutcome::new(triple.concept_id);
            for kind in NormalizedKind::ALL {
                let Some(text) = triple.text(kind) else {
                    continue;
                };
                let candidates = match kind {
                    NormalizedKind::Entity => &mut entity_candidates,
                    NormalizedKind::Aspect => &mut aspect_candidates,
                };
                match self.ingest_fragment(triple, kind, text, candidates) {
                    Ok(fragment) => {
                        report.count(&fragment);
                        outcome.set(kind, fragment);
                    }
                    Err(err) => {
                        warn!(concept_id = %triple.concept_id, kind = %kind, error = %err, "fragment not normalized");
                        report.failed += 1;
                        outcome.failures.push(FragmentFailure {
                            kind,
                            retryable: err.is_retryable(),
                            error: err.to_string(),
                        });
                    }
                }
            }
            report.outcomes.push(outcome);
        }

        info!(
            triples = triples.len(),
            created = report.created,
            matched = report.matched,
            degraded = report.degraded,
            failed = report.failed,
            elapsed_ms = duration_ms(started.elapsed()),
            "ingest batch finished"
        );
        Ok(report)
    }

    fn ingest_fragment(
        &self,
        triple: &ConceptTriple,
        kind: NormalizedKind,
        text: &str,
        candidates: &mut Vec<CandidateRecord>,
    ) -> NormResult<FragmentOutcome> {
        let companion = triple.companion(kind);
        let fragment = Fragment::new(kind, text).with_companion(companion);
        let resolution = self.resolver.resolve(fragment, candidates)?;

        if resolution.created() && candidates.len() < self.config.max_candidates {
            candidates.push(resolution.record.to_candidate());
        }

        let link = self.store.link_concept(ConceptLink {
            kind,
            concept_id: triple.concept_id,
            normalized_id: resolution.id(),
            matched_by: resolution.matched_by,
            match_confidence: resolution.confidence,
            original_text: text.to_string(),
            original_companion_text: companion.map(str::to_string),
            created_at: Utc::now(),
        })?;
        self.store
            .set_concept_normalized(triple.concept_id, kind, resolution.id(), &self.config.normalization_version)?;

        Ok(FragmentOutcome {
            normalized_id: resolution.id(),
            canonical_key: resolution.record.canonical_key,
            matched_by: resolution.matched_by,
            confidence: resolution.confidence,
            link,
        })
    }
}
