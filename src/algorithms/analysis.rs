use dashmap::DashMap;
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::graph::VertexMap;
use crate::types::{VertexId, VertexInfo};

/// Census of a converged component assignment.
///
/// # Fields
///
/// * `component_count` - number of distinct component labels.
/// * `largest_component` - size of the biggest component.
/// * `singleton_count` - components consisting of a single vertex.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComponentCensus {
    pub component_count: u64,
    pub largest_component: u64,
    pub singleton_count: u64,
}

/// Aggregates the component labels of a finished store.
///
/// Runs on the calling thread after the SPMD region has converged. Labels
/// are pulled out of the shards once, then counted into a concurrent census
/// map in parallel.
///
/// # Panics
/// If any vertex is still unlabeled, the run has not converged and the
/// census fails loudly.
pub fn component_census(map: &VertexMap) -> ComponentCensus {
    let labels: Vec<VertexId> = map.collect_all(|_vtx, info| {
        info.comp_id.expect("component census on an unconverged store")
    });

    let sizes = DashMap::<VertexId, u64>::new();
    labels.par_iter().for_each(|&comp| {
        *sizes.entry(comp).or_insert(0) += 1;
    });

    let mut largest_component = 0;
    let mut singleton_count = 0;
    for entry in sizes.iter() {
        let size = *entry.value();
        largest_component = largest_component.max(size);
        if size == 1 {
            singleton_count += 1;
        }
    }

    ComponentCensus {
        component_count: sizes.len() as u64,
        largest_component,
        singleton_count,
    }
}

/// Checks the edge mirror across the whole store: `u ∈ v.preds` exactly when
/// `v ∈ u.succs`. Diagnostic for tests and debugging, not a collective.
pub fn mirror_intact(map: &VertexMap) -> bool {
    let records: FxHashMap<VertexId, VertexInfo> = map
        .collect_all(|vtx, info| (vtx, info.clone()))
        .into_iter()
        .collect();

    records.iter().all(|(&vtx, info)| {
        info.succs
            .iter()
            .all(|succ| records.get(succ).is_some_and(|other| other.preds.contains(&vtx)))
            && info
                .preds
                .iter()
                .all(|pred| records.get(pred).is_some_and(|other| other.succs.contains(&vtx)))
    })
}
