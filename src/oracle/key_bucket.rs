//! Deterministic offline oracle.
//!
//! Decides equivalence purely from the keyer: two records are the same when
//! they share a bucket (keyed display name or keyed canonical key), and a
//! fragment matches a candidate when its key falls in one of the candidate's
//! buckets or in the bucket of one of its examples. It never invents ids, so
//! its answers always validate. Used when no model is configured.

use serde_json::{json, Value};

use super::{ClassifyManyRequest, ClassifyOneRequest, PairRecord, SemanticOracle};
use crate::error::OracleError;
use crate::keyer::canonical_key;
use crate::record::CandidateRecord;

/// Keyer-backed `SemanticOracle`.
#[derive(Debug, Clone, Copy)]
pub struct KeyBucketOracle {
    match_confidence: f32,
    create_confidence: f32,
}

impl Default for KeyBucketOracle {
    fn default() -> Self {
        Self {
            match_confidence: 0.9,
            create_confidence: 0.7,
        }
    }
}

fn pair_buckets(record: &PairRecord) -> [String; 2] {
    [
        canonical_key(&record.canonical_key),
        canonical_key(&record.display_name),
    ]
}

fn candidate_matches(candidate: &CandidateRecord, key: &str) -> bool {
    candidate.canonical_key == key
        || canonical_key(&candidate.canonical_key) == key
        || canonical_key(&candidate.display_name) == key
        || candidate.examples.iter().any(|e| canonical_key(e) == key)
}

impl KeyBucketOracle {
    /// Creates an oracle with default confidences.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the confidences reported for matches and creates.
    #[must_use]
    pub const fn with_confidences(mut self, match_confidence: f32, create_confidence: f32) -> Self {
        self.match_confidence = match_confidence;
        self.create_confidence = create_confidence;
        self
    }
}

impl SemanticOracle for KeyBucketOracle {
    fn classify_one(&self, request: &ClassifyOneRequest) -> Result<Value, OracleError> {
        let key = canonical_key(&request.fragment_text);
        if key.is_empty() {
            return Err(OracleError::malformed("fragment has no content to key"));
        }
        if let Some(found) = request.candidates.iter().find(|c| candidate_matches(c, &key)) {
            return Ok(json!({
                "action": "match",
                "normalized_id": found.id.to_string(),
                "confidence": self.match_confidence,
            }));
        }
        let display_name = request.fragment_text.trim();
        Ok(json!({
            "action": "create",
            "canonical_key": key,
            "display_name": display_name,
            "description": "",
            "examples": [display_name],
            "confidence": self.create_confidence,
        }))
    }

    fn classify_many(&self, request: &ClassifyManyRequest) -> Result<Value, OracleError> {
        let winner = pair_buckets(&request.winner);
        let results: Vec<Value> = request
            .losers
            .iter()
            .map(|loser| {
                let shared = pair_buckets(loser)
                    .into_iter()
                    .find(|b| !b.is_empty() && winner.contains(b));
                match shared {
                    Some(bucket) => json!({
                        "loser_id": loser.id.to_string(),
                        "same": true,
                        "confidence": self.match_confidence,
                        "reason": format!("shared bucket '{bucket}'"),
                    }),
                    None => json!({
                        "loser_id": loser.id.to_string(),
                        "same": false,
                        "confidence": self.match_confidence,
                        "reason": "no shared bucket",
                    }),
                }
            })
            .collect();
        Ok(json!({ "results": results }))
    }
}
