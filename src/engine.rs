//! The `Normalizer` facade: one store, one oracle pool, one configuration.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::concept::ConceptTriple;
use crate::config::NormalizerConfig;
use crate::error::NormResult;
use crate::ingest::{IngestReport, Ingestor};
use crate::merge::{ApplyReport, MergeExecutor, MergePlan, MergeScanner};
use crate::oracle::SemanticOracle;
use crate::record::NormalizedKind;
use crate::resolver::{candidate_list, Fragment, Resolution, SingleItemResolver};
use crate::runtime::OraclePool;
use crate::storage::{InMemoryNormalizationStore, NormalizationStore};

/// Records shown per kind in [`CatalogStats`].
const TOP_RECORDS: usize = 5;

/// Usage summary of one catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindStats {
    pub kind: NormalizedKind,
    pub active_records: usize,
    pub total_usage: u64,
    /// Most used records as `(canonical_key, usage_count)`.
    pub top: Vec<(String, u64)>,
}

/// Usage summary of both catalogs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogStats {
    pub kinds: Vec<KindStats>,
}

/// Normalization and deduplication engine.
///
/// ```
/// use std::sync::Arc;
/// use kyronorm::{KeyBucketOracle, NormalizedKind, Normalizer, NormalizerConfig};
///
/// let normalizer = Normalizer::in_memory(Arc::new(KeyBucketOracle::new()), NormalizerConfig::default()).unwrap();
/// let first = normalizer.resolve(NormalizedKind::Entity, "el camarero", None).unwrap();
/// let second = normalizer.resolve(NormalizedKind::Entity, "camareros", None).unwrap();
/// assert!(first.created());
/// assert_eq!(first.id(), second.id());
/// ```
pub struct Normalizer {
    store: Arc<dyn NormalizationStore>,
    pool: OraclePool,
    config: NormalizerConfig,
}

impl Normalizer {
    /// Creates an engine over a store. The configuration is validated and the
    /// oracle pool is started.
    ///
    /// # Errors
    /// `InvalidConfig` or a failure to spawn the pool.
    pub fn new(
        store: Arc<dyn NormalizationStore>,
        oracle: Arc<dyn SemanticOracle>,
        config: NormalizerConfig,
    ) -> NormResult<Self> {
        let config = config.validate()?;
        let pool = OraclePool::start(
            oracle,
            config.oracle_workers,
            config.oracle_queue_capacity,
            config.oracle_timeout(),
        )?;
        info!(
            workers = config.oracle_workers,
            queue_capacity = config.oracle_queue_capacity,
            timeout_ms = config.oracle_timeout_ms,
            version = %config.normalization_version,
            "normalizer started"
        );
        Ok(Self { store, pool, config })
    }

    /// Creates an engine over a fresh in-memory store.
    ///
    /// # Errors
    /// See [`Normalizer::new`].
    pub fn in_memory(oracle: Arc<dyn SemanticOracle>, config: NormalizerConfig) -> NormResult<Self> {
        Self::new(Arc::new(InMemoryNormalizationStore::new()), oracle, config)
    }

    /// Get a reference to the store.
    pub fn store(&self) -> &Arc<dyn NormalizationStore> {
        &self.store
    }

    /// Get the validated configuration.
    pub const fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Resolves one fragment against the most used active records.
    ///
    /// # Errors
    /// See [`SingleItemResolver::resolve`].
    pub fn resolve(&self, kind: NormalizedKind, text: &str, companion: Option<&str>) -> NormResult<Resolution> {
        let candidates = candidate_list(self.store.as_ref(), kind, self.config.max_candidates)?;
        SingleItemResolver::new(self.store.as_ref(), &self.pool, &self.config)
            .resolve(Fragment::new(kind, text).with_companion(companion), &candidates)
    }

    /// Ingests a batch of upstream triples.
    ///
    /// # Errors
    /// See [`Ingestor::ingest_batch`].
    pub fn ingest(&self, triples: &[ConceptTriple]) -> NormResult<IngestReport> {
        Ingestor::new(self.store.as_ref(), &self.pool, &self.config).ingest_batch(triples)
    }

    /// Scans the active records of a kind and returns the merge plan, without
    /// writing anything.
    ///
    /// # Errors
    /// Storage errors reading the snapshot, or a stopped pool.
    pub fn dry_run(&self, kind: NormalizedKind) -> NormResult<MergePlan> {
        let snapshot = self.store.list_active(kind)?;
        MergeScanner::new(&self.pool, &self.config).scan(kind, &snapshot)
    }

    /// Applies a plan produced by [`Normalizer::dry_run`].
    ///
    /// # Errors
    /// See [`MergeExecutor::apply`].
    pub fn apply(&self, plan: &MergePlan) -> NormResult<ApplyReport> {
        MergeExecutor::new(self.store.as_ref()).apply(plan)
    }

    /// Summarizes both catalogs.
    ///
    /// # Errors
    /// Propagates storage errors.
    pub fn stats(&self) -> NormResult<CatalogStats> {
        let mut kinds = Vec::with_capacity(NormalizedKind::ALL.len());
        for kind in NormalizedKind::ALL {
            let mut active = self.store.list_active(kind)?;
            active.sort_by(|a, b| {
                b.usage_count
                    .cmp(&a.usage_count)
                    .then_with(|| a.canonical_key.cmp(&b.canonical_key))
            });
            kinds.push(KindStats {
                kind,
                active_records: active.len(),
                total_usage: active.iter().map(|r| r.usage_count).sum(),
                top: active
                    .iter()
                    .take(TOP_RECORDS)
                    .map(|r| (r.canonical_key.clone(), r.usage_count))
                    .collect(),
            });
        }
        Ok(CatalogStats { kinds })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concept::ConceptTriple;
    use crate::link::ConceptId;
    use crate::oracle::KeyBucketOracle;

    fn normalizer() -> Normalizer {
        Normalizer::in_memory(Arc::new(KeyBucketOracle::new()), NormalizerConfig::default()).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = NormalizerConfig {
            oracle_workers: 0,
            ..NormalizerConfig::default()
        };
        let err = Normalizer::in_memory(Arc::new(KeyBucketOracle::new()), config).err().unwrap();
        assert!(err.is_validation());
    }

    #[test]
    fn test_resolve_and_stats() {
        let n = normalizer();
        n.resolve(NormalizedKind::Aspect, "precio", None).unwrap();
        n.resolve(NormalizedKind::Aspect, "precios", None).unwrap();
        n.resolve(NormalizedKind::Aspect, "limpieza", None).unwrap();

        let stats = n.stats().unwrap();
        let aspects = &stats.kinds[1];
        assert_eq!(aspects.kind, NormalizedKind::Aspect);
        assert_eq!(aspects.active_records, 2);
        assert_eq!(aspects.total_usage, 3);
        assert_eq!(aspects.top[0], ("precio".to_string(), 2));
        assert_eq!(stats.kinds[0].active_records, 0);
    }

    #[test]
    fn test_dry_run_then_apply() {
        let n = normalizer();
        n.ingest(&[ConceptTriple {
            concept_id: ConceptId::new(),
            entity_text: Some("personal".to_string()),
            aspect_text: Some("atencion".to_string()),
        }])
        .unwrap();

        let plan = n.dry_run(NormalizedKind::Entity).unwrap();
        assert!(plan.is_empty());
        let report = n.apply(&plan).unwrap();
        assert!(report.applied.is_empty());
        assert!(report.snapshot_matched);
    }
}
