//! Batch deduplication: dry-run scan and merge application.
//!
//! A dry-run produces a [`MergePlan`] from a catalog snapshot without
//! touching storage. Applying the plan rewrites storage one cluster at a
//! time through [`MergeExecutor`]; the winner of every cluster is the one
//! the dry-run showed.

pub mod executor;
pub mod plan;
pub mod scan;

pub use executor::{AppliedCluster, ApplyReport, FailedCluster, MergeExecutor, SkippedCluster};
pub use plan::{fingerprint, ClusterMember, ClusterPlan, EvidenceSource, FailedBatch, MergePlan, PairEvidence};
pub use scan::MergeScanner;
