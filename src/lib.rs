//! # kyronorm - normalization and deduplication of review fragments
//!
//! Review extraction produces free-text "entity" and "aspect" fragments
//! ("dependiente", "el helado de chocolate"). kyronorm consolidates them into
//! a small, stable catalog of canonical records:
//!
//! - **Resolution**: each new fragment either matches an existing record
//!   (by canonical key, or by the semantic oracle) or creates a new one.
//! - **Deduplication**: a dry-run scan finds near-duplicate records that were
//!   created independently, clusters them and picks a winner per cluster;
//!   applying the plan repoints links, deactivates losers and conserves usage.
//!
//! The oracle is untrusted: every answer is validated against the ids that
//! were offered, and every failure degrades to a safe create instead of
//! aborting. Records are never deleted, only deactivated.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use kyronorm::{ConceptId, ConceptTriple, KeyBucketOracle, NormalizedKind, Normalizer, NormalizerConfig};
//!
//! let normalizer = Normalizer::in_memory(Arc::new(KeyBucketOracle::new()), NormalizerConfig::default())?;
//!
//! let report = normalizer.ingest(&[ConceptTriple {
//!     concept_id: ConceptId::new(),
//!     entity_text: Some("el helado de chocolate".to_string()),
//!     aspect_text: Some("sabor".to_string()),
//! }])?;
//! assert_eq!(report.created, 2);
//!
//! let plan = normalizer.dry_run(NormalizedKind::Entity)?;
//! let applied = normalizer.apply(&plan)?;
//! assert!(applied.is_complete());
//! # Ok::<(), kyronorm::NormError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Data model
pub mod concept;
pub mod confidence;
pub mod error;
pub mod link;
pub mod record;

// Text and clustering primitives
pub mod candidates;
pub mod cluster;
pub mod keyer;
pub mod winner;

// Oracle boundary and worker pool
pub mod oracle;
pub mod runtime;

// Storage, aliases and the write paths
pub mod alias;
pub mod ingest;
pub mod merge;
pub mod resolver;
pub mod storage;

// Facade
pub mod config;
pub mod engine;

pub use alias::{AliasEdge, AliasResolver, AliasTarget};
pub use candidates::{CandidateConfig, CandidateGenerator};
pub use cluster::{ClusterBuilder, SharedClusterBuilder};
pub use concept::{Concept, ConceptTriple};
pub use confidence::Confidence;
pub use config::NormalizerConfig;
pub use engine::{CatalogStats, KindStats, Normalizer};
pub use error::{ExecutionError, NormError, NormResult, OracleError, ValidationError};
pub use ingest::{IngestReport, Ingestor, TripleOutcome};
pub use keyer::{canonical_key, CanonicalKeyer};
pub use link::{ConceptId, ConceptLink, LinkOutcome, MatchedBy};
pub use merge::{ApplyReport, ClusterPlan, MergeExecutor, MergePlan, MergeScanner};
pub use oracle::{JsonOracle, KeyBucketOracle, OracleTransport, SemanticOracle};
pub use record::{CandidateRecord, CreatedBy, NewRecord, NormalizedId, NormalizedKind, NormalizedRecord};
pub use resolver::{Fragment, Resolution, SingleItemResolver};
pub use runtime::OraclePool;
pub use storage::{InMemoryNormalizationStore, NormalizationStore, StorageError};
pub use winner::select_winner;

#[cfg(feature = "persistent")]
pub use storage::persistent::{open_database, PersistentConfig, PersistentNormalizationStore};
