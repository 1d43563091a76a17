//! Dry-run scan: finds duplicate clusters in a catalog snapshot.
//!
//! The scan works on the snapshot it is handed and never reads live storage:
//! 1. Records sharing a keyer bucket are joined directly.
//! 2. The candidate generator proposes cross-bucket pairs, batched per
//!    winner, and the oracle adjudicates each batch on the worker pool.
//! 3. Confirmed pairs are unioned; components of two or more records become
//!    clusters, each with a deterministic winner.
//!
//! A batch whose oracle call fails is recorded and its pairs stay unmerged;
//! a failure is never read as "no duplicate".

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Instant;

use tracing::{debug, info, warn};

use super::plan::{fingerprint, ClusterMember, ClusterPlan, EvidenceSource, FailedBatch, MergePlan, PairEvidence};
use crate::candidates::{record_buckets, CandidateBatch, CandidateGenerator};
use crate::cluster::ClusterBuilder;
use crate::config::NormalizerConfig;
use crate::error::{ExecutionError, NormError, NormResult};
use crate::oracle::{validate_classify_many, ClassifyManyRequest, PairRecord};
use crate::record::{NormalizedId, NormalizedKind, NormalizedRecord};
use crate::runtime::{duration_ms, OracleHandle, OraclePool};
use crate::winner::{select_winner, winner_order};

/// Runs dry-run scans through an oracle pool.
pub struct MergeScanner<'a> {
    pool: &'a OraclePool,
    config: &'a NormalizerConfig,
    generator: CandidateGenerator,
}

struct Pending {
    batch: CandidateBatch,
    handle: OracleHandle,
}

struct Collector {
    builder: ClusterBuilder,
    evidence: Vec<PairEvidence>,
    failed: Vec<FailedBatch>,
}

impl Collector {
    fn join(&mut self, evidence: PairEvidence) {
        self.builder.union(evidence.a, evidence.b);
        self.evidence.push(evidence);
    }

    fn fail(&mut self, batch: CandidateBatch, err: &NormError) {
        warn!(winner = %batch.winner, losers = batch.losers.len(), error = %err, "oracle batch failed; pairs left unmerged");
        self.failed.push(FailedBatch {
            winner: batch.winner,
            losers: batch.losers,
            error: err.to_string(),
        });
    }
}

impl<'a> MergeScanner<'a> {
    /// Creates a scanner.
    #[must_use]
    pub fn new(pool: &'a OraclePool, config: &'a NormalizerConfig) -> Self {
        Self {
            pool,
            config,
            generator: CandidateGenerator::new(config.candidates.clone()),
        }
    }

    /// Scans a snapshot of one kind. Inactive records in the snapshot are ignored.
    ///
    /// # Errors
    /// Only pool shutdown surfaces as an error; oracle failures are recorded
    /// in `MergePlan::failed_batches`.
    pub fn scan(&self, kind: NormalizedKind, snapshot: &[NormalizedRecord]) -> NormResult<MergePlan> {
        let started = Instant::now();
        let mut records: Vec<&NormalizedRecord> =
            snapshot.iter().filter(|r| r.is_active && r.kind == kind).collect();
        records.sort_by(|a, b| winner_order(a, b));
        let by_id: HashMap<NormalizedId, &NormalizedRecord> = records.iter().map(|r| (r.id, *r)).collect();

        let mut collector = Collector {
            builder: ClusterBuilder::new(records.iter().map(|r| r.id)),
            evidence: Vec::new(),
            failed: Vec::new(),
        };

        self.join_buckets(&records, &mut collector);

        let owned: Vec<NormalizedRecord> = records.iter().map(|r| (*r).clone()).collect();
        let batches = self.generator.generate(&owned);
        let pairs_evaluated = batches.iter().map(|b| b.losers.len()).sum();
        debug!(kind = %kind, batches = batches.len(), pairs = pairs_evaluated, "candidate batches generated");
        self.run_batches(batches, &by_id, &mut collector)?;

        let Collector {
            mut builder,
            evidence,
            failed,
        } = collector;

        let mut clusters: Vec<ClusterPlan> = Vec::new();
        for ids in builder.clusters() {
            let members: Vec<NormalizedRecord> = ids
                .iter()
                .filter_map(|id| by_id.get(id).map(|r| (*r).clone()))
                .collect();
            let Some((winner, losers)) = select_winner(&members) else {
                continue;
            };
            let cluster_evidence = evidence
                .iter()
                .filter(|e| ids.binary_search(&e.a).is_ok())
                .cloned()
                .collect();
            clusters.push(ClusterPlan {
                kind,
                winner: winner.into(),
                losers: losers.into_iter().map(ClusterMember::from).collect(),
                evidence: cluster_evidence,
            });
        }
        clusters.sort_by(|a, b| {
            b.winner
                .usage_count
                .cmp(&a.winner.usage_count)
                .then_with(|| a.winner.created_at.cmp(&b.winner.created_at))
                .then_with(|| a.winner.id.cmp(&b.winner.id))
        });

        let fingerprint = fingerprint(kind, &owned, &clusters);
        info!(
            kind = %kind,
            records = records.len(),
            pairs = pairs_evaluated,
            clusters = clusters.len(),
            failed_batches = failed.len(),
            elapsed_ms = duration_ms(started.elapsed()),
            "dry-run scan finished"
        );

        Ok(MergePlan {
            kind,
            created_at: chrono::Utc::now(),
            records_scanned: records.len(),
            pairs_evaluated,
            clusters,
            failed_batches: failed,
            fingerprint,
        })
    }

    /// Joins records whose buckets overlap, ranked-first record as anchor.
    fn join_buckets(&self, records: &[&NormalizedRecord], collector: &mut Collector) {
        let mut anchors: BTreeMap<String, NormalizedId> = BTreeMap::new();
        for record in records {
            for bucket in record_buckets(record) {
                match anchors.get(&bucket) {
                    Some(&anchor) if anchor != record.id => collector.join(PairEvidence {
                        a: anchor,
                        b: record.id,
                        source: EvidenceSource::Bucket,
                        confidence: self.config.bucket_match(),
                        reason: format!("shared bucket '{bucket}'"),
                    }),
                    Some(_) => {}
                    None => {
                        anchors.insert(bucket, record.id);
                    }
                }
            }
        }
    }

    /// Submits batches with at most `queue_capacity` calls in flight.
    fn run_batches(
        &self,
        batches: Vec<CandidateBatch>,
        by_id: &HashMap<NormalizedId, &NormalizedRecord>,
        collector: &mut Collector,
    ) -> NormResult<()> {
        let window = self.pool.queue_capacity();
        let mut in_flight: VecDeque<Pending> = VecDeque::new();

        for batch in batches {
            let Some(request) = request_for(&batch, by_id) else {
                continue;
            };
            while in_flight.len() >= window {
                if let Some(pending) = in_flight.pop_front() {
                    self.settle(pending, collector);
                }
            }
            loop {
                match self.pool.submit_many(request.clone()) {
                    Ok(handle) => {
                        in_flight.push_back(Pending { batch, handle });
                        break;
                    }
                    // Another caller shares the pool; make room and retry.
                    Err(NormError::Execution(ExecutionError::QueueFull { .. })) if !in_flight.is_empty() => {
                        if let Some(pending) = in_flight.pop_front() {
                            self.settle(pending, collector);
                        }
                    }
                    Err(err @ NormError::Execution(ExecutionError::Disconnected)) => return Err(err),
                    Err(err) => {
                        collector.fail(batch, &err);
                        break;
                    }
                }
            }
        }

        while let Some(pending) = in_flight.pop_front() {
            self.settle(pending, collector);
        }
        Ok(())
    }

    fn settle(&self, pending: Pending, collector: &mut Collector) {
        let Pending { batch, handle } = pending;
        let verdicts = handle.wait().and_then(|raw| {
            validate_classify_many(&raw, &batch.losers, self.config.default_oracle_confidence())
                .map_err(NormError::from)
        });
        match verdicts {
            Ok(verdicts) => {
                if verdicts.len() < batch.losers.len() {
                    debug!(
                        winner = %batch.winner,
                        offered = batch.losers.len(),
                        answered = verdicts.len(),
                        "oracle left some pairs undecided"
                    );
                }
                for verdict in verdicts.into_iter().filter(|v| v.same) {
                    collector.join(PairEvidence {
                        a: batch.winner,
                        b: verdict.loser,
                        source: EvidenceSource::Oracle,
                        confidence: verdict.confidence,
                        reason: verdict.reason,
                    });
                }
            }
            Err(err) => collector.fail(batch, &err),
        }
    }
}

fn request_for(batch: &CandidateBatch, by_id: &HashMap<NormalizedId, &NormalizedRecord>) -> Option<ClassifyManyRequest> {
    let winner = by_id.get(&batch.winner)?;
    Some(ClassifyManyRequest {
        winner: PairRecord::from(*winner),
        losers: batch
            .losers
            .iter()
            .filter_map(|id| by_id.get(id).map(|r| PairRecord::from(*r)))
            .collect(),
    })
}
