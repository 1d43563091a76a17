//! Validation of raw oracle responses.
//!
//! Validators never trust field presence: a missing or mistyped required
//! field is `Malformed`, a match against an id the caller did not offer is
//! repaired by key or name or else rejected as `UnverifiableMatch`, and
//! confidences are clamped with a fallback default.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::confidence::Confidence;
use crate::error::OracleError;
use crate::keyer::canonical_key;
use crate::record::{CandidateRecord, NormalizedId};
use crate::storage::MAX_EXAMPLES;

/// A create proposal that passed validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateProposal {
    /// Already run through the keyer; never empty.
    pub canonical_key: String,
    pub display_name: String,
    pub description: String,
    pub examples: Vec<String>,
    pub confidence: Confidence,
}

/// A classify-one decision that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub enum OneDecision {
    /// The oracle named a candidate id that was offered.
    Match {
        id: NormalizedId,
        confidence: Confidence,
    },
    /// The oracle named an unknown id, but its key or name identifies a candidate.
    Repaired {
        id: NormalizedId,
        confidence: Confidence,
        claimed: String,
    },
    /// The oracle proposed a new record.
    Create(CreateProposal),
}

/// One loser's verdict from a classify-many batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairVerdict {
    pub loser: NormalizedId,
    pub same: bool,
    pub confidence: Confidence,
    pub reason: String,
}

fn str_field<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    let mut out: Vec<String> = Vec::new();
    for item in items.iter().filter_map(Value::as_str) {
        let item = item.trim();
        if item.is_empty() || out.iter().any(|e| e == item) {
            continue;
        }
        out.push(item.to_string());
        if out.len() >= MAX_EXAMPLES {
            break;
        }
    }
    out
}

/// Finds the candidate a claimed key or name refers to.
///
/// Keys are compared before names; a key is compared both verbatim and
/// after canonicalization.
fn repair<'a>(claims: &[&str], candidates: &'a [CandidateRecord]) -> Option<&'a CandidateRecord> {
    for claim in claims {
        let keyed = canonical_key(claim);
        if let Some(c) = candidates
            .iter()
            .find(|c| c.canonical_key == *claim || (!keyed.is_empty() && c.canonical_key == keyed))
        {
            return Some(c);
        }
    }
    for claim in claims {
        if let Some(c) = candidates
            .iter()
            .find(|c| c.display_name.trim().eq_ignore_ascii_case(claim))
        {
            return Some(c);
        }
    }
    None
}

/// Validates a classify-one response against the candidates that were offered.
///
/// # Errors
/// - `Malformed` if the response is not an object, the action is unknown, or
///   a required field is missing
/// - `UnverifiableMatch` if a match names neither an offered id nor the key or
///   name of an offered candidate
pub fn validate_classify_one(
    response: &Value,
    candidates: &[CandidateRecord],
    default_confidence: Confidence,
) -> Result<OneDecision, OracleError> {
    if !response.is_object() {
        return Err(OracleError::malformed("response is not a JSON object"));
    }
    let confidence = Confidence::from_json(response.get("confidence"), default_confidence);

    match str_field(response, "action").map(str::to_ascii_lowercase).as_deref() {
        Some("match") => {
            let claimed_id = str_field(response, "normalized_id").or_else(|| str_field(response, "id"));
            if let Some(id) = claimed_id.and_then(NormalizedId::parse) {
                if candidates.iter().any(|c| c.id == id) {
                    return Ok(OneDecision::Match { id, confidence });
                }
            }

            let claims: Vec<&str> = [
                str_field(response, "canonical_key"),
                str_field(response, "display_name"),
                claimed_id,
            ]
            .into_iter()
            .flatten()
            .collect();
            let claimed = claims.first().map_or_else(String::new, |c| (*c).to_string());
            match repair(&claims, candidates) {
                Some(found) => {
                    debug!(claimed = %claimed, repaired_to = %found.id, "repaired oracle match");
                    Ok(OneDecision::Repaired {
                        id: found.id,
                        confidence,
                        claimed,
                    })
                }
                None => Err(OracleError::UnverifiableMatch { claimed }),
            }
        }
        Some("create") => {
            let display_name = str_field(response, "display_name")
                .ok_or_else(|| OracleError::malformed("create without display_name"))?;
            let key = str_field(response, "canonical_key")
                .map(canonical_key)
                .filter(|k| !k.is_empty())
                .unwrap_or_else(|| canonical_key(display_name));
            if key.is_empty() {
                return Err(OracleError::malformed(format!(
                    "create '{display_name}' has an empty canonical key"
                )));
            }
            Ok(OneDecision::Create(CreateProposal {
                canonical_key: key,
                display_name: display_name.to_string(),
                description: str_field(response, "description").unwrap_or_default().to_string(),
                examples: string_list(response.get("examples")),
                confidence,
            }))
        }
        Some(other) => Err(OracleError::malformed(format!("unknown action '{other}'"))),
        None => Err(OracleError::malformed("missing action")),
    }
}

/// Validates a classify-many response against the losers that were offered.
///
/// Entries naming an id outside `losers`, repeating an id, or lacking a
/// boolean `same` are dropped with a warning. Losers without a usable entry
/// are absent from the output. Output follows the order of `losers`.
///
/// # Errors
/// `Malformed` if the response has no `results` array.
pub fn validate_classify_many(
    response: &Value,
    losers: &[NormalizedId],
    default_confidence: Confidence,
) -> Result<Vec<PairVerdict>, OracleError> {
    let results = response
        .get("results")
        .and_then(Value::as_array)
        .ok_or_else(|| OracleError::malformed("missing results array"))?;

    let offered: HashSet<NormalizedId> = losers.iter().copied().collect();
    let mut seen: HashSet<NormalizedId> = HashSet::new();
    let mut verdicts: Vec<PairVerdict> = Vec::with_capacity(results.len());

    for entry in results {
        let Some(raw_id) = str_field(entry, "loser_id") else {
            warn!("oracle verdict without loser_id dropped");
            continue;
        };
        let Some(loser) = NormalizedId::parse(raw_id).filter(|id| offered.contains(id)) else {
            warn!(loser_id = %raw_id, "oracle verdict for an id that was not offered dropped");
            continue;
        };
        let Some(same) = entry.get("same").and_then(Value::as_bool) else {
            warn!(loser_id = %raw_id, "oracle verdict without boolean 'same' dropped");
            continue;
        };
        if !seen.insert(loser) {
            warn!(loser_id = %raw_id, "duplicate oracle verdict dropped");
            continue;
        }
        verdicts.push(PairVerdict {
            loser,
            same,
            confidence: Confidence::from_json(entry.get("confidence"), default_confidence),
            reason: str_field(entry, "reason").unwrap_or_default().to_string(),
        });
    }

    verdicts.sort_by_key(|v| losers.iter().position(|l| *l == v.loser));
    Ok(verdicts)
}
