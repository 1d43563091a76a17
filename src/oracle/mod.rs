//! The semantic equivalence oracle boundary.
//!
//! The oracle is external, slow and unreliable. It is modelled as a narrow
//! trait with two calls that return raw JSON; nothing it says is trusted
//! until it passes the validators in [`validate`], which check field
//! presence, clamp confidences and verify every id against the set the
//! caller actually offered.

use serde::{Deserialize, Serialize};

use crate::error::OracleError;
use crate::record::{CandidateRecord, NormalizedId, NormalizedRecord};

pub mod json;
pub mod key_bucket;
pub mod validate;

pub use json::{extract_json, JsonOracle, OracleMode, OracleTransport};
pub use key_bucket::KeyBucketOracle;
pub use validate::{
    validate_classify_many, validate_classify_one, CreateProposal, OneDecision, PairVerdict,
};

/// "Classify one" request: should this fragment match a candidate or become a new record?
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifyOneRequest {
    /// The raw fragment.
    pub fragment_text: String,
    /// Companion fragment for context (the aspect of an entity, or vice versa).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub companion_context: Option<String>,
    /// Bounded list of active records the fragment may match.
    pub candidates: Vec<CandidateRecord>,
}

/// Minimal view of a record in a classify-many batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairRecord {
    pub id: NormalizedId,
    pub display_name: String,
    pub canonical_key: String,
}

impl From<&NormalizedRecord> for PairRecord {
    fn from(record: &NormalizedRecord) -> Self {
        Self {
            id: record.id,
            display_name: record.display_name.clone(),
            canonical_key: record.canonical_key.clone(),
        }
    }
}

/// "Classify many" request: which of these losers are the same as the winner?
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifyManyRequest {
    pub winner: PairRecord,
    pub losers: Vec<PairRecord>,
}

/// Adjudicates ambiguous match and merge decisions.
///
/// Implementations return the oracle's response verbatim as JSON. Expected
/// shapes:
///
/// ```text
/// classify_one:  { "action": "match", "normalized_id": "...", "confidence": 0.9 }
///             |  { "action": "create", "canonical_key": "...", "display_name": "...",
///                  "description": "...", "examples": ["..."], "confidence": 0.8 }
/// classify_many: { "results": [ { "loser_id": "...", "same": true,
///                                 "confidence": 0.9, "reason": "..." } ] }
/// ```
pub trait SemanticOracle: Send + Sync {
    /// Classifies one fragment against a candidate list.
    ///
    /// # Errors
    /// Transport failures and timeouts.
    fn classify_one(&self, request: &ClassifyOneRequest) -> Result<serde_json::Value, OracleError>;

    /// Compares one winner with a batch of losers.
    ///
    /// # Errors
    /// Transport failures and timeouts.
    fn classify_many(&self, request: &ClassifyManyRequest)
        -> Result<serde_json::Value, OracleError>;
}

impl<T: SemanticOracle + ?Sized> SemanticOracle for std::sync::Arc<T> {
    fn classify_one(&self, request: &ClassifyOneRequest) -> Result<serde_json::Value, OracleError> {
        (**self).classify_one(request)
    }

    fn classify_many(
        &self,
        request: &ClassifyManyRequest,
    ) -> Result<serde_json::Value, OracleError> {
        (**self).classify_many(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_oracle_object_safe(_: &dyn SemanticOracle) {}

    #[test]
    fn test_request_wire_shape() {
        let request = ClassifyManyRequest {
            winner: PairRecord {
                id: NormalizedId::nil(),
                display_name: "personal".to_string(),
                canonical_key: "personal".to_string(),
            },
            losers: Vec::new(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["winner"]["canonical_key"], "personal");
        assert!(value["losers"].as_array().unwrap().is_empty());

        let one = ClassifyOneRequest {
            fragment_text: "dependienta".to_string(),
            companion_context: None,
            candidates: Vec::new(),
        };
        let value = serde_json::to_value(&one).unwrap();
        assert!(value.get("companion_context").is_none());
    }
}
