//! Dry-run output: the clusters a merge would apply, with their evidence.

use blake3::Hasher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::confidence::Confidence;
use crate::record::{NormalizedId, NormalizedKind, NormalizedRecord};
use crate::storage::ClusterMerge;

/// What joined two records into one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceSource {
    /// Both display names fall in the same canonical-key bucket.
    Bucket,
    /// The oracle confirmed the pair.
    Oracle,
}

/// One confirmed "same" edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairEvidence {
    pub a: NormalizedId,
    pub b: NormalizedId,
    pub source: EvidenceSource,
    pub confidence: Confidence,
    pub reason: String,
}

/// Snapshot of a cluster member at planning time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub id: NormalizedId,
    pub canonical_key: String,
    pub display_name: String,
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
}

impl From<&NormalizedRecord> for ClusterMember {
    fn from(record: &NormalizedRecord) -> Self {
        Self {
            id: record.id,
            canonical_key: record.canonical_key.clone(),
            display_name: record.display_name.clone(),
            usage_count: record.usage_count,
            created_at: record.created_at,
        }
    }
}

/// One cluster, winner first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterPlan {
    pub kind: NormalizedKind,
    pub winner: ClusterMember,
    pub losers: Vec<ClusterMember>,
    /// Edges inside the cluster that justified it.
    pub evidence: Vec<PairEvidence>,
}

impl ClusterPlan {
    /// Returns the rewrite this cluster asks the store for.
    #[must_use]
    pub fn to_merge(&self) -> ClusterMerge {
        ClusterMerge {
            kind: self.kind,
            winner: self.winner.id,
            losers: self.losers.iter().map(|l| l.id).collect(),
        }
    }

    /// Winner usage the merge should leave behind.
    #[must_use]
    pub fn expected_winner_usage(&self) -> u64 {
        self.losers
            .iter()
            .fold(self.winner.usage_count, |acc, l| acc.saturating_add(l.usage_count))
    }

    /// Number of records in the cluster.
    #[must_use]
    pub fn size(&self) -> usize {
        self.losers.len() + 1
    }
}

/// An oracle batch whose answer could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedBatch {
    pub winner: NormalizedId,
    pub losers: Vec<NormalizedId>,
    pub error: String,
}

/// Result of a dry-run scan over one kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergePlan {
    pub kind: NormalizedKind,
    pub created_at: DateTime<Utc>,
    /// Active records in the snapshot.
    pub records_scanned: usize,
    /// Candidate pairs sent to the oracle.
    pub pairs_evaluated: usize,
    pub clusters: Vec<ClusterPlan>,
    /// Batches skipped because the oracle failed; their pairs stay unmerged.
    pub failed_batches: Vec<FailedBatch>,
    /// Hex blake3 digest of the snapshot and the clusters.
    pub fingerprint: String,
}

impl MergePlan {
    /// Returns true if there is nothing to merge.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Total losers across clusters.
    #[must_use]
    pub fn loser_count(&self) -> usize {
        self.clusters.iter().map(|c| c.losers.len()).sum()
    }

    /// Recomputes the fingerprint from a snapshot and compares.
    #[must_use]
    pub fn matches_snapshot(&self, records: &[NormalizedRecord]) -> bool {
        fingerprint(self.kind, records, &self.clusters) == self.fingerprint
    }
}

/// Digests the active snapshot a plan was computed from, and its clusters.
///
/// Records are hashed in id order, so the digest does not depend on the
/// order `list_active` returned them in.
#[must_use]
pub fn fingerprint(kind: NormalizedKind, records: &[NormalizedRecord], clusters: &[ClusterPlan]) -> String {
    let mut ordered: Vec<&NormalizedRecord> = records.iter().filter(|r| r.is_active).collect();
    ordered.sort_by_key(|r| r.id);

    let mut h = Hasher::new();
    h.update(kind.as_str().as_bytes());
    h.update(&(ordered.len() as u64).to_le_bytes());
    for record in ordered {
        h.update(record.id.as_uuid().as_bytes());
        h.update(&record.usage_count.to_le_bytes());
        h.update(record.canonical_key.as_bytes());
        h.update(&[0]);
    }
    h.update(&(clusters.len() as u64).to_le_bytes());
    for cluster in clusters {
        h.update(cluster.winner.id.as_uuid().as_bytes());
        h.update(&(cluster.losers.len() as u64).to_le_bytes());
        for loser in &cluster.losers {
            h.update(loser.id.as_uuid().as_bytes());
        }
    }
    h.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{CreatedBy, NewRecord};

    fn record(key: &str, usage: u64) -> NormalizedRecord {
        let mut r = NormalizedRecord::from_new(
            NormalizedKind::Aspect,
            NewRecord {
                canonical_key: key.to_string(),
                display_name: key.to_string(),
                description: String::new(),
                examples: Vec::new(),
                confidence: Confidence::clamped(0.8),
                created_by: CreatedBy::Ai,
            },
        );
        r.usage_count = usage;
        r
    }

    fn cluster(winner: &NormalizedRecord, losers: &[&NormalizedRecord]) -> ClusterPlan {
        ClusterPlan {
            kind: NormalizedKind::Aspect,
            winner: winner.into(),
            losers: losers.iter().map(|l| ClusterMember::from(*l)).collect(),
            evidence: Vec::new(),
        }
    }

    #[test]
    fn test_expected_usage_and_merge() {
        let w = record("precio", 5);
        let l1 = record("precios_alto", 2);
        let l2 = record("precio_caro", 3);
        let plan = cluster(&w, &[&l1, &l2]);
        assert_eq!(plan.expected_winner_usage(), 10);
        assert_eq!(plan.size(), 3);
        assert_eq!(plan.to_merge().losers, vec![l1.id, l2.id]);
    }

    #[test]
    fn test_fingerprint_tracks_usage_not_order() {
        let a = record("precio", 5);
        let b = record("precio_caro", 3);
        let clusters = vec![cluster(&a, &[&b])];

        let fp = fingerprint(NormalizedKind::Aspect, &[a.clone(), b.clone()], &clusters);
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, fingerprint(NormalizedKind::Aspect, &[b.clone(), a.clone()], &clusters));

        let mut bumped = b.clone();
        bumped.usage_count += 1;
        assert_ne!(fp, fingerprint(NormalizedKind::Aspect, &[a.clone(), bumped], &clusters));
        assert_ne!(fp, fingerprint(NormalizedKind::Entity, &[a, b], &clusters));
    }
}
