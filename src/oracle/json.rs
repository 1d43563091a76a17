//! JSON-over-text oracle adapter.
//!
//! LLM-backed oracles answer with text that usually, but not always, is the
//! JSON document that was asked for: it may be wrapped in a fenced code
//! block or surrounded by prose. `JsonOracle` builds the request payloads,
//! hands them to a pluggable transport, and extracts the JSON object from
//! whatever comes back.

use std::sync::LazyLock;
use std::time::Instant;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use super::{ClassifyManyRequest, ClassifyOneRequest, SemanticOracle};
use crate::error::OracleError;
use crate::runtime::duration_ms;

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*\})\s*```").expect("fenced JSON pattern is valid")
});

/// Which oracle call a payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OracleMode {
    /// One fragment against a candidate list.
    ClassifyOne,
    /// One winner against a batch of candidate losers.
    ClassifyMany,
}

impl OracleMode {
    /// Returns a stable name, suitable for logs and prompt selection.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClassifyOne => "classify_one",
            Self::ClassifyMany => "classify_many",
        }
    }
}

/// Sends a request payload to a model and returns its raw text answer.
pub trait OracleTransport: Send + Sync {
    /// Performs one call.
    ///
    /// # Errors
    /// Transport failures and timeouts.
    fn complete(&self, mode: OracleMode, payload: &Value) -> Result<String, OracleError>;
}

/// Extracts the JSON object from an oracle answer.
///
/// Tries, in order: the whole text, the first fenced code block, and the
/// span from the first `{` to the last `}`.
///
/// # Errors
/// `Malformed` if no candidate parses as a JSON object.
pub fn extract_json(text: &str) -> Result<Value, OracleError> {
    let text = text.trim();
    let fenced = FENCED_JSON
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str());
    let braced = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => Some(&text[start..=end]),
        _ => None,
    };

    [Some(text), fenced, braced]
        .into_iter()
        .flatten()
        .find_map(|candidate| {
            serde_json::from_str::<Value>(candidate)
                .ok()
                .filter(Value::is_object)
        })
        .ok_or_else(|| {
            let preview: String = text.chars().take(80).collect();
            OracleError::malformed(format!("no JSON object in oracle answer: {preview:?}"))
        })
}

/// A `SemanticOracle` over any text transport.
#[derive(Debug, Clone)]
pub struct JsonOracle<T> {
    transport: T,
}

impl<T: OracleTransport> JsonOracle<T> {
    /// Wraps a transport.
    #[must_use]
    pub const fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Returns the transport.
    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    fn call(&self, mode: OracleMode, payload: Value) -> Result<Value, OracleError> {
        let started = Instant::now();
        let answer = self.transport.complete(mode, &payload)?;
        debug!(
            mode = mode.as_str(),
            elapsed_ms = duration_ms(started.elapsed()),
            bytes = answer.len(),
            "oracle answered"
        );
        extract_json(&answer)
    }
}

impl<T: OracleTransport> SemanticOracle for JsonOracle<T> {
    fn classify_one(&self, request: &ClassifyOneRequest) -> Result<Value, OracleError> {
        let payload = serde_json::to_value(request)
            .map_err(|e| OracleError::transport(format!("failed to encode request: {e}")))?;
        self.call(OracleMode::ClassifyOne, payload)
    }

    fn classify_many(&self, request: &ClassifyManyRequest) -> Result<Value, OracleError> {
        let payload = serde_json::to_value(request)
            .map_err(|e| OracleError::transport(format!("failed to encode request: {e}")))?;
        self.call(OracleMode::ClassifyMany, payload)
    }
}
