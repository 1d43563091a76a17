//! Union-find clustering of confirmed "same" pairs.
//!
//! Union is commutative and associative, so pair verdicts can arrive in any
//! order, from any worker, and still produce the same partition. Components
//! are closed transitively: a~b and b~c put a, b and c in one cluster even if
//! a~c was never asked.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::record::NormalizedId;

/// Disjoint-set forest over record ids with path compression and union by rank.
#[derive(Debug, Default, Clone)]
pub struct ClusterBuilder {
    index: HashMap<NormalizedId, usize>,
    ids: Vec<NormalizedId>,
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl ClusterBuilder {
    /// Creates a builder with one singleton node per id.
    #[must_use]
    pub fn new(ids: impl IntoIterator<Item = NormalizedId>) -> Self {
        let mut builder = Self::default();
        for id in ids {
            builder.add(id);
        }
        builder
    }

    /// Adds a singleton node. Adding an existing id is a no-op.
    pub fn add(&mut self, id: NormalizedId) {
        if self.index.contains_key(&id) {
            return;
        }
        let slot = self.ids.len();
        self.index.insert(id, slot);
        self.ids.push(id);
        self.parent.push(slot);
        self.rank.push(0);
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true if the builder has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn find(&mut self, mut slot: usize) -> usize {
        let mut root = slot;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        while self.parent[slot] != root {
            let next = self.parent[slot];
            self.parent[slot] = root;
            slot = next;
        }
        root
    }

    /// Joins the components of two ids.
    ///
    /// Returns false if either id is unknown or both already share a component.
    pub fn union(&mut self, a: NormalizedId, b: NormalizedId) -> bool {
        let (Some(&sa), Some(&sb)) = (self.index.get(&a), self.index.get(&b)) else {
            return false;
        };
        let (ra, rb) = (self.find(sa), self.find(sb));
        if ra == rb {
            return false;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] = self.rank[ra].saturating_add(1);
            }
        }
        true
    }

    /// Returns true if both ids are known and share a component.
    pub fn connected(&mut self, a: NormalizedId, b: NormalizedId) -> bool {
        match (self.index.get(&a).copied(), self.index.get(&b).copied()) {
            (Some(sa), Some(sb)) => self.find(sa) == self.find(sb),
            _ => false,
        }
    }

    /// Returns every component with at least two members.
    ///
    /// Members are sorted by id and clusters by their smallest id, so the
    /// output does not depend on union order.
    pub fn clusters(&mut self) -> Vec<Vec<NormalizedId>> {
        let mut groups: BTreeMap<usize, Vec<NormalizedId>> = BTreeMap::new();
        for slot in 0..self.ids.len() {
            let root = self.find(slot);
            groups.entry(root).or_default().push(self.ids[slot]);
        }
        let mut out: Vec<Vec<NormalizedId>> = groups
            .into_values()
            .filter(|g| g.len() >= 2)
            .map(|mut g| {
                g.sort();
                g
            })
            .collect();
        out.sort_by(|a, b| a[0].cmp(&b[0]));
        out
    }
}

/// A `ClusterBuilder` that oracle workers can feed concurrently.
#[derive(Debug, Default)]
pub struct SharedClusterBuilder {
    inner: Mutex<ClusterBuilder>,
}

impl SharedClusterBuilder {
    /// Wraps a builder.
    #[must_use]
    pub fn new(builder: ClusterBuilder) -> Self {
        Self {
            inner: Mutex::new(builder),
        }
    }

    /// Joins two ids. A poisoned lock is recovered; union has no partial state.
    pub fn union(&self, a: NormalizedId, b: NormalizedId) -> bool {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.union(a, b)
    }

    /// Returns the inner builder once all workers are done.
    #[must_use]
    pub fn into_inner(self) -> ClusterBuilder {
        self.inner
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
