use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dashmap::DashMap;
use rustc_hash::FxHasher;

use crate::comm::Comm;
use crate::types::VertexId;

/// A key-partitioned distributed map.
///
/// Every key is owned by exactly one rank, chosen by hashing the key over
/// the rank count. Each rank's partition is a shard only that rank mutates:
/// remote ranks request mutations by sending a visit, which the owner
/// executes serially with all its other handlers. Visits to keys the map has
/// never seen create the record through `V::default()`.
///
/// The non-collective accessors at the bottom (`get_cloned`, `collect_all`,
/// `len`) are for reporting and tests once an SPMD region has finished.
pub struct DistMap<V> {
    shards: Vec<Arc<DashMap<VertexId, V>>>,
}

impl<V: Default + Send + Sync + 'static> DistMap<V> {
    pub fn new(num_ranks: usize) -> Self {
        assert!(num_ranks >= 1, "a map needs at least one partition");
        DistMap {
            shards: (0..num_ranks).map(|_| Arc::new(DashMap::new())).collect(),
        }
    }

    pub fn num_ranks(&self) -> usize {
        self.shards.len()
    }

    /// The rank owning `key`. Stable for the life of the map and identical
    /// on every rank.
    pub fn owner(&self, key: VertexId) -> usize {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Ships `visit` to the owner of `key`. The owner runs it against the
    /// (possibly freshly created) record during its next barrier, with its
    /// own `Comm` in hand so the visitor can send follow-up visits.
    pub fn async_visit<F>(&self, comm: &Comm, key: VertexId, visit: F)
    where
        F: FnOnce(&Comm, VertexId, &mut V) + Send + 'static,
    {
        let owner = self.owner(key);
        let shard = Arc::clone(&self.shards[owner]);
        comm.send(
            owner,
            Box::new(move |comm: &Comm| {
                let mut record = shard.entry(key).or_default();
                visit(comm, key, record.value_mut());
            }),
        );
    }

    /// Applies `visit` immediately to a record the calling rank owns.
    /// Absent keys are ignored.
    pub fn local_visit<F>(&self, comm: &Comm, key: VertexId, visit: F)
    where
        F: FnOnce(&Comm, VertexId, &mut V),
    {
        debug_assert_eq!(
            self.owner(key),
            comm.rank(),
            "local visit to a record owned elsewhere"
        );
        if let Some(mut record) = self.shards[comm.rank()].get_mut(&key) {
            visit(comm, key, record.value_mut());
        }
    }

    /// Iterates the calling rank's partition.
    pub fn local_for_all<F>(&self, comm: &Comm, mut f: F)
    where
        F: FnMut(VertexId, &mut V),
    {
        for mut record in self.shards[comm.rank()].iter_mut() {
            let key = *record.key();
            f(key, record.value_mut());
        }
    }

    /// Collective iteration: every rank walks its own partition, so across
    /// the world each record is seen exactly once.
    pub fn for_all<F>(&self, comm: &Comm, f: F)
    where
        F: FnMut(VertexId, &mut V),
    {
        self.local_for_all(comm, f);
    }

    /// Total record count across all partitions.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clones one record out of the map.
    pub fn get_cloned(&self, key: VertexId) -> Option<V>
    where
        V: Clone,
    {
        self.shards[self.owner(key)]
            .get(&key)
            .map(|record| record.value().clone())
    }

    /// Maps every record through `f` into a plain vector, shard by shard.
    pub fn collect_all<T>(&self, f: impl Fn(VertexId, &V) -> T) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len());
        for shard in &self.shards {
            for record in shard.iter() {
                out.push(f(*record.key(), record.value()));
            }
        }
        out
    }
}
