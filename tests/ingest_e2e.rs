//! End-to-end tests for ingestion followed by deduplication.
//!
//! These tests verify that:
//! - Ingestion links concepts and stamps the normalization version
//! - Records created independently are merged by a later dry-run and apply
//! - Concepts follow their records through a merge
//! - Fragments keyed to a retired record land on the merge winner

use std::sync::Arc;

use serde_json::{json, Value};

use kyronorm::oracle::{ClassifyManyRequest, ClassifyOneRequest};
use kyronorm::{
    canonical_key, ConceptId, ConceptTriple, MatchedBy, NormalizedKind, Normalizer, NormalizerConfig, OracleError,
    SemanticOracle,
};

/// Never matches a single fragment; confirms pairs within a synonym group.
struct Synonyms(Vec<Vec<&'static str>>);

impl Synonyms {
    fn group_of(&self, key: &str) -> Option<usize> {
        self.0.iter().position(|g| g.contains(&key))
    }
}

impl SemanticOracle for Synonyms {
    fn classify_one(&self, request: &ClassifyOneRequest) -> Result<Value, OracleError> {
        let text = request.fragment_text.trim();
        Ok(json!({
            "action": "create",
            "canonical_key": canonical_key(text),
            "display_name": text,
            "description": "",
            "examples": [text],
            "confidence": 0.75,
        }))
    }

    fn classify_many(&self, request: &ClassifyManyRequest) -> Result<Value, OracleError> {
        let winner = self.group_of(&request.winner.canonical_key);
        let results: Vec<Value> = request
            .losers
            .iter()
            .map(|l| {
                let same = winner.is_some() && self.group_of(&l.canonical_key) == winner;
                json!({"loser_id": l.id.to_string(), "same": same, "confidence": 0.9, "reason": "synonyms"})
            })
            .collect();
        Ok(json!({ "results": results }))
    }
}

fn triple(concept_id: ConceptId, entity: &str, aspect: &str) -> ConceptTriple {
    ConceptTriple {
        concept_id,
        entity_text: Some(entity.to_string()),
        aspect_text: Some(aspect.to_string()),
    }
}

fn normalizer() -> Normalizer {
    Normalizer::in_memory(
        Arc::new(Synonyms(vec![vec!["camarero", "camarera"]])),
        NormalizerConfig::default(),
    )
    .unwrap()
}

#[test]
fn test_ingest_then_merge_repoints_concepts() {
    let normalizer = normalizer();
    let store = Arc::clone(normalizer.store());
    let (c1, c2, c3, c4) = (ConceptId::new(), ConceptId::new(), ConceptId::new(), ConceptId::new());

    let report = normalizer
        .ingest(&[
            triple(c1, "camarero", "amabilidad"),
            triple(c2, "la camarera", "amabilidad"),
            triple(c3, "Camarero", "rapidez"),
            triple(c4, "mesero", "atención"),
        ])
        .unwrap();
    assert_eq!(report.failed, 0);
    assert_eq!(report.degraded, 0);
    assert_eq!(report.created, 6);
    assert_eq!(report.matched, 2);
    assert_eq!(
        report.outcomes[2].fragment(NormalizedKind::Entity).unwrap().matched_by,
        MatchedBy::CanonicalKey
    );

    let camarera = store.find_by_key(NormalizedKind::Entity, "camarera").unwrap().unwrap();
    let concept = store.get_concept(c2).unwrap().unwrap();
    assert_eq!(concept.normalized(NormalizedKind::Entity), Some(camarera.id));
    assert_eq!(concept.normalization_version.as_deref(), Some("v1"));

    let plan = normalizer.dry_run(NormalizedKind::Entity).unwrap();
    assert_eq!(plan.clusters.len(), 1);
    let cluster = &plan.clusters[0];
    assert_eq!(cluster.winner.canonical_key, "camarero");
    assert_eq!(cluster.losers.len(), 1);
    assert_eq!(cluster.losers[0].id, camarera.id);

    let applied = normalizer.apply(&plan).unwrap();
    assert!(applied.is_complete());
    assert_eq!(applied.deactivated(), 1);

    let winner = store.find_by_key(NormalizedKind::Entity, "camarero").unwrap().unwrap();
    assert_eq!(winner.usage_count, 3);
    let concept = store.get_concept(c2).unwrap().unwrap();
    assert_eq!(concept.normalized(NormalizedKind::Entity), Some(winner.id));
    let links = store.links_for_concept(NormalizedKind::Entity, c2).unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].normalized_id, winner.id);
    assert_eq!(links[0].original_text, "la camarera");
    assert_eq!(links[0].original_companion_text.as_deref(), Some("amabilidad"));

    // The aspect of the merged concept is untouched.
    let amabilidad = store.find_by_key(NormalizedKind::Aspect, "amabilidad").unwrap().unwrap();
    assert_eq!(concept.normalized(NormalizedKind::Aspect), Some(amabilidad.id));
    assert_eq!(amabilidad.usage_count, 2);

    // A later fragment keyed to the retired record resolves to the winner.
    let c5 = ConceptId::new();
    let report = normalizer.ingest(&[triple(c5, "camareras", "simpatía")]).unwrap();
    let entity = report.outcomes[0].fragment(NormalizedKind::Entity).unwrap();
    assert_eq!(entity.matched_by, MatchedBy::Alias);
    assert_eq!(entity.normalized_id, winner.id);
    assert_eq!(
        store.get_concept(c5).unwrap().unwrap().normalized(NormalizedKind::Entity),
        Some(winner.id)
    );
    assert_eq!(
        store.find_by_key(NormalizedKind::Entity, "camarero").unwrap().unwrap().usage_count,
        4
    );
}

#[test]
fn test_reingesting_a_concept_is_idempotent_on_links() {
    let normalizer = normalizer();
    let store = Arc::clone(normalizer.store());
    let c1 = ConceptId::new();

    normalizer.ingest(&[triple(c1, "terraza", "ambiente")]).unwrap();
    let report = normalizer.ingest(&[triple(c1, "la terraza", "ambiente")]).unwrap();

    let entity = report.outcomes[0].fragment(NormalizedKind::Entity).unwrap();
    assert_eq!(entity.link, kyronorm::LinkOutcome::AlreadyLinked);
    assert_eq!(store.links_for_concept(NormalizedKind::Entity, c1).unwrap().len(), 1);
}

#[test]
fn test_blank_fragments_are_skipped() {
    let normalizer = normalizer();
    let c1 = ConceptId::new();
    let report = normalizer
        .ingest(&[ConceptTriple {
            concept_id: c1,
            entity_text: Some("   ".to_string()),
            aspect_text: None,
        }])
        .unwrap();
    assert_eq!(report.outcomes.len(), 1);
    assert!(report.outcomes[0].entity.is_none());
    assert!(report.outcomes[0].aspect.is_none());
    assert!(report.outcomes[0].failures.is_empty());
    assert!(normalizer.store().get_concept(c1).unwrap().is_none());
}

#[test]
fn test_report_serializes_for_the_cli() {
    let normalizer = normalizer();
    let report = normalizer.ingest(&[triple(ConceptId::new(), "postre", "sabor")]).unwrap();
    let value = serde_json::to_value(&report).unwrap();
    assert_eq!(value["created"], 2);
    assert_eq!(value["outcomes"][0]["entity"]["matched_by"], "created");
    assert_eq!(value["outcomes"][0]["entity"]["canonical_key"], "postre");
    assert!(value["outcomes"][0].get("failures").is_none());

    let stats = normalizer.stats().unwrap();
    let value = serde_json::to_value(&stats).unwrap();
    assert!(value["kinds"].is_array());
}
