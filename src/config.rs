//! Engine configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::candidates::CandidateConfig;
use crate::confidence::Confidence;
use crate::error::{NormError, NormResult, ValidationError};

/// Highest confidence a degraded create may carry.
pub const MAX_DEGRADED_CONFIDENCE: f32 = 0.6;

/// Configuration of a [`crate::Normalizer`].
///
/// Loads from JSON; every field is optional and falls back to its default.
///
/// ```
/// use kyronorm::NormalizerConfig;
///
/// let config = NormalizerConfig::from_json_str(r#"{"oracle_workers": 8}"#).unwrap();
/// assert_eq!(config.oracle_workers, 8);
/// assert_eq!(config.max_candidates, 200);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NormalizerConfig {
    /// Candidate pair thresholds for the dry-run.
    pub candidates: CandidateConfig,
    /// Concurrent oracle calls.
    pub oracle_workers: usize,
    /// Oracle calls that may wait for a worker.
    pub oracle_queue_capacity: usize,
    /// Per-call oracle timeout.
    pub oracle_timeout_ms: u64,
    /// Confidence of a canonical-key fast-path match.
    pub exact_match_confidence: f32,
    /// Confidence of a dry-run pair joined by shared bucket.
    pub bucket_match_confidence: f32,
    /// Confidence of a create made after the oracle failed. At most 0.6.
    pub degraded_confidence: f32,
    /// Confidence assumed when the oracle omits one.
    pub default_confidence: f32,
    /// Candidates offered to the oracle per fragment.
    pub max_candidates: usize,
    /// Tag stamped on concepts this engine normalized.
    pub normalization_version: String,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            candidates: CandidateConfig::default(),
            oracle_workers: 4,
            oracle_queue_capacity: 256,
            oracle_timeout_ms: 30_000,
            exact_match_confidence: 0.95,
            bucket_match_confidence: 0.95,
            degraded_confidence: 0.5,
            default_confidence: 0.7,
            max_candidates: 200,
            normalization_version: "v1".to_string(),
        }
    }
}

fn invalid(reason: impl Into<String>) -> NormError {
    ValidationError::InvalidConfig {
        reason: reason.into(),
    }
    .into()
}

impl NormalizerConfig {
    /// Checks ranges and returns the configuration.
    ///
    /// # Errors
    /// Returns `InvalidConfig` naming the first offending field.
    pub fn validate(self) -> NormResult<Self> {
        self.candidates.validate()?;
        if self.oracle_workers == 0 {
            return Err(invalid("oracle_workers must be at least 1"));
        }
        if self.oracle_queue_capacity == 0 {
            return Err(invalid("oracle_queue_capacity must be at least 1"));
        }
        if self.oracle_timeout_ms == 0 {
            return Err(invalid("oracle_timeout_ms must be positive"));
        }
        if self.max_candidates == 0 {
            return Err(invalid("max_candidates must be at least 1"));
        }
        for (field, value) in [
            ("exact_match_confidence", self.exact_match_confidence),
            ("bucket_match_confidence", self.bucket_match_confidence),
            ("degraded_confidence", self.degraded_confidence),
            ("default_confidence", self.default_confidence),
        ] {
            if Confidence::new(value).is_err() {
                return Err(invalid(format!("{field} must be within [0, 1] (got {value})")));
            }
        }
        if self.degraded_confidence > MAX_DEGRADED_CONFIDENCE {
            return Err(invalid(format!(
                "degraded_confidence must be at most {MAX_DEGRADED_CONFIDENCE} (got {})",
                self.degraded_confidence
            )));
        }
        if self.normalization_version.trim().is_empty() {
            return Err(invalid("normalization_version cannot be empty"));
        }
        Ok(self)
    }

    /// Parses and validates a JSON document.
    ///
    /// # Errors
    /// Returns `InvalidConfig` on a parse error or an invalid value.
    pub fn from_json_str(json: &str) -> NormResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| invalid(e.to_string()))?;
        config.validate()
    }

    /// Reads, parses and validates a JSON file.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the file cannot be read or is invalid.
    pub fn from_path(path: impl AsRef<Path>) -> NormResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| invalid(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    /// Oracle timeout as a `Duration`.
    #[must_use]
    pub const fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.oracle_timeout_ms)
    }

    pub(crate) fn exact_match(&self) -> Confidence {
        Confidence::clamped(self.exact_match_confidence)
    }

    pub(crate) fn bucket_match(&self) -> Confidence {
        Confidence::clamped(self.bucket_match_confidence)
    }

    pub(crate) fn degraded(&self) -> Confidence {
        Confidence::clamped(self.degraded_confidence.min(MAX_DEGRADED_CONFIDENCE))
    }

    pub(crate) fn default_oracle_confidence(&self) -> Confidence {
        Confidence::clamped(self.default_confidence)
    }
}
