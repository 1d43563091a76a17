//! Storage for the normalized catalogs.
//!
//! `NormalizationStore` is the contract every backend implements. The
//! in-memory backend is the reference implementation; the `persistent`
//! feature adds a WAL-backed embedded store built on the same state.

mod changeset;
mod memory;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use changeset::{ChangeSet, Mutation, StoreSnapshot};
pub use memory::{InMemoryNormalizationStore, MAX_EXAMPLES};
pub use traits::{ClusterMerge, MergeOutcome, NormalizationStore, StorageError, UpsertOutcome};

pub(crate) use memory::StoreState;
