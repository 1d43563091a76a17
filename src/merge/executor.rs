//! Applies a merge plan to live storage, one cluster at a time.
//!
//! Each cluster is re-checked against the store before it is applied: the
//! winner and every loser must still exist and be active. A cluster that no
//! longer holds is skipped as stale. A cluster whose write fails is reported
//! and the remaining clusters still run.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::plan::{ClusterPlan, MergePlan};
use crate::error::{ExecutionError, NormError, NormResult};
use crate::record::{NormalizedId, NormalizedKind};
use crate::storage::{MergeOutcome, NormalizationStore};

/// A cluster that was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedCluster {
    pub winner: NormalizedId,
    pub losers: Vec<NormalizedId>,
    pub outcome: MergeOutcome,
}

/// A cluster left alone because storage moved on since the dry-run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedCluster {
    pub winner: NormalizedId,
    pub reason: String,
}

/// A cluster whose write failed. Nothing of it was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedCluster {
    pub winner: NormalizedId,
    pub losers: Vec<NormalizedId>,
    pub error: String,
    /// True if running the cluster again may succeed.
    pub retryable: bool,
}

/// Result of applying one plan.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApplyReport {
    pub applied: Vec<AppliedCluster>,
    pub skipped_stale: Vec<SkippedCluster>,
    pub failed: Vec<FailedCluster>,
    /// False if the active catalog changed between the dry-run and the apply.
    pub snapshot_matched: bool,
}

impl ApplyReport {
    /// Records deactivated across applied clusters.
    #[must_use]
    pub fn deactivated(&self) -> usize {
        self.applied.iter().map(|a| a.outcome.deactivated).sum()
    }

    /// Returns true if every cluster was applied.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.skipped_stale.is_empty() && self.failed.is_empty()
    }
}

/// Writes merge plans to a store.
pub struct MergeExecutor<'a> {
    store: &'a dyn NormalizationStore,
}

impl<'a> MergeExecutor<'a> {
    /// Creates an executor over a store.
    #[must_use]
    pub fn new(store: &'a dyn NormalizationStore) -> Self {
        Self { store }
    }

    /// Applies every cluster of a plan.
    ///
    /// # Errors
    /// Only a failure to read the active catalog surfaces; per-cluster
    /// failures are collected in the report.
    pub fn apply(&self, plan: &MergePlan) -> NormResult<ApplyReport> {
        let live = self.store.list_active(plan.kind)?;
        let snapshot_matched = plan.matches_snapshot(&live);
        if !snapshot_matched {
            info!(kind = %plan.kind, fingerprint = %plan.fingerprint, "catalog changed since dry-run; clusters are re-checked");
        }

        let mut report = ApplyReport {
            snapshot_matched,
            ..ApplyReport::default()
        };
        for cluster in &plan.clusters {
            let losers: Vec<NormalizedId> = cluster.losers.iter().map(|l| l.id).collect();
            match self.apply_cluster(cluster) {
                Ok(outcome) => report.applied.push(AppliedCluster {
                    winner: cluster.winner.id,
                    losers,
                    outcome,
                }),
                Err(NormError::Execution(ExecutionError::StaleCluster { reason })) => {
                    warn!(kind = %plan.kind, winner = %cluster.winner.id, reason = %reason, "stale cluster skipped");
                    report.skipped_stale.push(SkippedCluster {
                        winner: cluster.winner.id,
                        reason,
                    });
                }
                Err(err) => {
                    warn!(kind = %plan.kind, winner = %cluster.winner.id, error = %err, "cluster merge failed");
                    report.failed.push(FailedCluster {
                        winner: cluster.winner.id,
                        losers,
                        retryable: err.is_retryable(),
                        error: err.to_string(),
                    });
                }
            }
        }

        info!(
            kind = %plan.kind,
            applied = report.applied.len(),
            stale = report.skipped_stale.len(),
            failed = report.failed.len(),
            deactivated = report.deactivated(),
            "merge plan applied"
        );
        Ok(report)
    }

    /// Re-checks and applies one cluster.
    ///
    /// # Errors
    /// - `Execution(StaleCluster)` if a member is gone or inactive
    /// - `Storage(..)` if the write fails
    pub fn apply_cluster(&self, cluster: &ClusterPlan) -> NormResult<MergeOutcome> {
        let kind = cluster.kind;
        self.check_member(kind, cluster.winner.id, "winner")?;
        for loser in &cluster.losers {
            self.check_member(kind, loser.id, "loser")?;
        }
        let outcome = self.store.apply_merge(&cluster.to_merge())?;
        info!(
            kind = %kind,
            winner = %cluster.winner.canonical_key,
            losers = cluster.losers.len(),
            repointed = outcome.repointed_links,
            removed_duplicates = outcome.removed_duplicate_links,
            usage_after = outcome.winner_usage_after,
            "cluster merged"
        );
        Ok(outcome)
    }

    fn check_member(&self, kind: NormalizedKind, id: NormalizedId, role: &str) -> NormResult<()> {
        match self.store.get_record(kind, id)? {
            Some(record) if record.is_active => Ok(()),
            Some(_) => Err(ExecutionError::StaleCluster {
                reason: format!("{role} {id} is no longer active"),
            }
            .into()),
            None => Err(ExecutionError::StaleCluster {
                reason: format!("{role} {id} no longer exists"),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::confidence::Confidence;
    use crate::merge::plan::{fingerprint, ClusterMember};
    use crate::record::{CreatedBy, NewRecord, NormalizedRecord};
    use crate::storage::{ClusterMerge, InMemoryNormalizationStore};

    fn insert(store: &InMemoryNormalizationStore, key: &str, usage: u64) -> NormalizedRecord {
        let mut record = NormalizedRecord::from_new(
            NormalizedKind::Entity,
            NewRecord {
                canonical_key: key.to_string(),
                display_name: key.to_string(),
                description: String::new(),
                examples: Vec::new(),
                confidence: Confidence::clamped(0.9),
                created_by: CreatedBy::Ai,
            },
        );
        record.usage_count = usage;
        store.insert_record(record.clone()).unwrap();
        record
    }

    fn plan_of(store: &InMemoryNormalizationStore, clusters: Vec<ClusterPlan>) -> MergePlan {
        let live = store.list_active(NormalizedKind::Entity).unwrap();
        MergePlan {
            kind: NormalizedKind::Entity,
            created_at: Utc::now(),
            records_scanned: live.len(),
            pairs_evaluated: 0,
            fingerprint: fingerprint(NormalizedKind::Entity, &live, &clusters),
            clusters,
            failed_batches: Vec::new(),
        }
    }

    fn cluster(winner: &NormalizedRecord, losers: &[&NormalizedRecord]) -> ClusterPlan {
        ClusterPlan {
            kind: NormalizedKind::Entity,
            winner: winner.into(),
            losers: losers.iter().map(|l| ClusterMember::from(*l)).collect(),
            evidence: Vec::new(),
        }
    }

    #[test]
    fn test_apply_conserves_usage() {
        let store = InMemoryNormalizationStore::new();
        let w = insert(&store, "personal", 6);
        let l1 = insert(&store, "dependiente", 3);
        let l2 = insert(&store, "dependienta", 1);
        let plan = plan_of(&store, vec![cluster(&w, &[&l1, &l2])]);

        let report = MergeExecutor::new(&store).apply(&plan).unwrap();
        assert!(report.is_complete());
        assert!(report.snapshot_matched);
        assert_eq!(report.deactivated(), 2);
        assert_eq!(report.applied[0].outcome.winner_usage_after, 10);
        assert_eq!(plan.clusters[0].expected_winner_usage(), 10);
    }

    #[test]
    fn test_stale_cluster_skipped_others_applied() {
        let store = InMemoryNormalizationStore::new();
        let a = insert(&store, "personal", 6);
        let b = insert(&store, "dependiente", 3);
        let c = insert(&store, "terraza", 5);
        let d = insert(&store, "terrazas_exterior", 2);
        let plan = plan_of(&store, vec![cluster(&a, &[&b]), cluster(&c, &[&d])]);

        // Someone merged b elsewhere after the dry-run.
        store
            .apply_merge(&ClusterMerge {
                kind: NormalizedKind::Entity,
                winner: c.id,
                losers: vec![b.id],
            })
            .unwrap();

        let report = MergeExecutor::new(&store).apply(&plan).unwrap();
        assert!(!report.snapshot_matched);
        assert_eq!(report.skipped_stale.len(), 1);
        assert_eq!(report.skipped_stale[0].winner, a.id);
        assert!(report.skipped_stale[0].reason.contains("loser"));
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.applied[0].winner, c.id);
        assert!(store.get_record(NormalizedKind::Entity, a.id).unwrap().unwrap().is_active);
    }

    #[test]
    fn test_missing_member_is_stale() {
        let store = InMemoryNormalizationStore::new();
        let w = insert(&store, "personal", 6);
        let ghost = NormalizedRecord {
            id: NormalizedId::new(),
            ..w.clone()
        };
        let err = MergeExecutor::new(&store)
            .apply_cluster(&cluster(&w, &[&ghost]))
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("no longer exists"));
    }
}
