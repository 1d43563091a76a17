//! Upstream concepts, seen only at their boundary.
//!
//! The extraction pipeline owns concepts. This crate reads the raw triples it
//! produces and writes back two things: the current normalized ids and the
//! normalization version that produced them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::link::ConceptId;
use crate::record::{NormalizedId, NormalizedKind};

/// A raw `{concept_id, entity_text, aspect_text}` triple from the extraction pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptTriple {
    pub concept_id: ConceptId,
    #[serde(default)]
    pub entity_text: Option<String>,
    #[serde(default)]
    pub aspect_text: Option<String>,
}

impl ConceptTriple {
    /// Returns the fragment text for a kind, if present and non-blank.
    #[must_use]
    pub fn text(&self, kind: NormalizedKind) -> Option<&str> {
        let text = match kind {
            NormalizedKind::Entity => self.entity_text.as_deref(),
            NormalizedKind::Aspect => self.aspect_text.as_deref(),
        };
        text.map(str::trim).filter(|t| !t.is_empty())
    }

    /// Returns the text of the other kind, used as companion context.
    #[must_use]
    pub fn companion(&self, kind: NormalizedKind) -> Option<&str> {
        match kind {
            NormalizedKind::Entity => self.text(NormalizedKind::Aspect),
            NormalizedKind::Aspect => self.text(NormalizedKind::Entity),
        }
    }
}

/// The normalization state a concept carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    pub id: ConceptId,

    /// Current normalized entity.
    #[serde(default)]
    pub normalized_entity_id: Option<NormalizedId>,

    /// Current normalized aspect.
    #[serde(default)]
    pub normalized_aspect_id: Option<NormalizedId>,

    /// Version tag of the normalization run that last touched the concept.
    #[serde(default)]
    pub normalization_version: Option<String>,

    pub updated_at: DateTime<Utc>,
}

impl Concept {
    /// Creates a concept with no normalization yet.
    #[must_use]
    pub fn new(id: ConceptId) -> Self {
        Self {
            id,
            normalized_entity_id: None,
            normalized_aspect_id: None,
            normalization_version: None,
            updated_at: Utc::now(),
        }
    }

    /// Returns the current normalized id of a kind.
    #[must_use]
    pub const fn normalized(&self, kind: NormalizedKind) -> Option<NormalizedId> {
        match kind {
            NormalizedKind::Entity => self.normalized_entity_id,
            NormalizedKind::Aspect => self.normalized_aspect_id,
        }
    }

    /// Points the concept at a normalized record of a kind.
    pub fn set_normalized(&mut self, kind: NormalizedKind, id: NormalizedId) {
        match kind {
            NormalizedKind::Entity => self.normalized_entity_id = Some(id),
            NormalizedKind::Aspect => self.normalized_aspect_id = Some(id),
        }
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triple_text_skips_blank() {
        let triple = ConceptTriple {
            concept_id: ConceptId::new(),
            entity_text: Some("  dependiente ".to_string()),
            aspect_text: Some("   ".to_string()),
        };
        assert_eq!(triple.text(NormalizedKind::Entity), Some("dependiente"));
        assert_eq!(triple.text(NormalizedKind::Aspect), None);
        assert_eq!(triple.companion(NormalizedKind::Aspect), Some("dependiente"));
        assert_eq!(triple.companion(NormalizedKind::Entity), None);
    }

    #[test]
    fn test_set_normalized_by_kind() {
        let mut concept = Concept::new(ConceptId::new());
        let id = NormalizedId::new();
        concept.set_normalized(NormalizedKind::Aspect, id);
        assert_eq!(concept.normalized(NormalizedKind::Aspect), Some(id));
        assert_eq!(concept.normalized(NormalizedKind::Entity), None);
    }

    #[test]
    fn test_triple_deserializes_with_missing_aspect() {
        let id = ConceptId::new();
        let json = format!("{{\"concept_id\":\"{id}\",\"entity_text\":\"helado\"}}");
        let triple: ConceptTriple = serde_json::from_str(&json).unwrap();
        assert_eq!(triple.aspect_text, None);
        assert_eq!(triple.text(NormalizedKind::Entity), Some("helado"));
    }
}
