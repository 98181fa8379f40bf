use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};

use log::{debug, info};

use crate::comm::Comm;
use crate::config::PIVOT_SEED_BASE;
use crate::graph::{self, VertexMap};
use crate::permuter::Permuter;
use crate::types::{VertexId, VertexInfo};

/// Which way a traversal moves over the edge mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// Pending label broadcasts of one rank, smallest label first. Popping the
/// most dominant label early spares dominated sends; any pop order would
/// still converge.
type PivotQueue = BinaryHeap<Reverse<(VertexId, VertexId)>>;
type PivotQueues = Vec<Mutex<PivotQueue>>;

/// Configuration for the divide-and-conquer component solver.
///
/// # Fields
///
/// * `seed` - base seed of the pivot permutation; the iteration number is
///   added so every round draws fresh pivots, reproducibly on all ranks.
#[derive(Debug, Clone, Copy)]
pub struct SccConfig {
    pub seed: u64,
}

impl Default for SccConfig {
    fn default() -> Self {
        SccConfig {
            seed: PIVOT_SEED_BASE,
        }
    }
}

/// Distributed divide-and-conquer strongly connected component solver.
///
/// The solver labels every vertex of the store with the component it belongs
/// to by iterating five bulk-synchronous phases until no active vertex
/// remains:
///
/// 1. **Trim** peels vertices with no in- or out-edges; each is its own
///    trivial component, and a peel can cascade arbitrarily deep.
/// 2. **Subproblem assignment** draws a permuted identity per vertex and
///    floods the minimum over each weakly connected piece of the residual
///    graph, so every piece agrees on one pivot without coordination.
/// 3. **Reach propagation** marks the pivot's ancestors and descendants
///    inside its own piece; vertices holding both marks form the pivot's
///    component.
/// 4. **Edge shearing** cuts every edge whose endpoints fall in different
///    reachability quadrants; no component of the residual graph can cross
///    such an edge, and the next round's pieces shrink accordingly.
/// 5. **Freeze** retires the extracted component and clears the scratch of
///    everything else, reporting how many vertices are still unresolved.
pub struct SccSolver {
    map: Arc<VertexMap>,
    queues: Arc<PivotQueues>,
    config: SccConfig,
}

impl SccSolver {
    /// Creates a solver over the given store, one broadcast queue per rank.
    pub fn new(map: Arc<VertexMap>, config: SccConfig) -> Self {
        let queues = Arc::new(
            (0..map.num_ranks())
                .map(|_| Mutex::new(PivotQueue::new()))
                .collect::<Vec<_>>(),
        );
        SccSolver {
            map,
            queues,
            config,
        }
    }

    /// Runs the iteration to convergence. Collective; returns the number of
    /// iterations executed (identical on every rank).
    pub fn solve(&self, comm: &Comm) -> u64 {
        let (min_id, max_id) = graph::id_range(comm, &self.map);
        if comm.rank() == 0 {
            debug!("vertex id range [{min_id}, {max_id}]");
        }

        let mut iteration = 0u64;
        loop {
            self.trim(comm);
            self.assign_subproblems(comm, iteration, min_id, max_id);
            self.propagate_reach(comm);
            self.shear_edges(comm);
            let unterminated = self.freeze_and_reset(comm);

            if comm.rank() == 0 {
                info!("iteration {iteration}: {unterminated} vertices unterminated");
            }
            iteration += 1;
            if unterminated == 0 {
                return iteration;
            }
        }
    }

    /// Retires every vertex that cannot be on a cycle because it lacks
    /// in-edges or out-edges, cascading through the holes the retirements
    /// tear open. Afterwards every active vertex has at least one live
    /// predecessor and one live successor.
    fn trim(&self, comm: &Comm) {
        let map = &self.map;
        self.map.local_for_all(comm, |vtx, info| {
            if !info.active {
                return;
            }
            if info.preds.is_empty() {
                info.retire(vtx);
                for &succ in &info.succs {
                    send_trim(map, comm, succ, vtx, Direction::Forward);
                }
                info.succs.clear();
            } else if info.succs.is_empty() {
                info.retire(vtx);
                for &pred in &info.preds {
                    send_trim(map, comm, pred, vtx, Direction::Backward);
                }
                info.preds.clear();
            }
        });
        comm.barrier();
    }

    /// Draws this iteration's pivot identities and floods the minimum over
    /// every weakly connected piece, so that afterwards all members of a
    /// piece carry the same `wcc_pivot` and exactly one of them (the pivot)
    /// carries its own.
    ///
    /// The flood drains through pre-barrier callbacks: every queue push
    /// registers one callback, each callback pops one entry, discards it if
    /// a smaller label has since landed, and otherwise broadcasts it to the
    /// whole neighborhood. The closing barrier cannot complete while any
    /// queue or mailbox still holds work.
    fn assign_subproblems(&self, comm: &Comm, iteration: u64, min_id: VertexId, max_id: VertexId) {
        let perm = Permuter::new(min_id, max_id, self.config.seed.wrapping_add(iteration));

        self.map.local_for_all(comm, |vtx, info| {
            if info.active {
                let drawn = perm.permute(vtx);
                info.pivot = Some(drawn);
                info.wcc_pivot = Some(drawn);
                info.marker = Some(vtx);
            }
        });
        comm.barrier();

        let map = &self.map;
        let queues = &self.queues;
        self.map.local_for_all(comm, |vtx, info| {
            if !info.active {
                return;
            }
            let Some(own) = info.wcc_pivot else { return };

            // A vertex with a provably smaller neighbor stays silent: its
            // broadcast would be superseded by the neighbor's.
            let dominated = info
                .succs
                .iter()
                .chain(info.preds.iter())
                .any(|&nbr| perm.permute(nbr) < own);
            if dominated {
                return;
            }

            queues[comm.rank()].lock().unwrap().push(Reverse((own, vtx)));
            let map_cb = Arc::clone(map);
            let queues_cb = Arc::clone(queues);
            comm.register_pre_barrier_callback(move |comm| {
                broadcast_next(&map_cb, &queues_cb, comm)
            });
        });
        comm.barrier();

        assert!(
            self.queues[comm.rank()].lock().unwrap().is_empty(),
            "subproblem labels left undelivered after the barrier"
        );
    }

    /// Marks, for every subproblem pivot, the vertices it can reach forward
    /// and backward without leaving its own subproblem. A vertex holding
    /// both marks is mutually reachable with the pivot.
    fn propagate_reach(&self, comm: &Comm) {
        let map = &self.map;
        self.map.local_for_all(comm, |vtx, info| {
            if !info.active || !info.is_pivot() {
                return;
            }
            info.mark_desc = true;
            info.mark_pred = true;
            info.marker = Some(vtx);

            let label = info.wcc_pivot.expect("a pivot carries its subproblem label");
            for &pred in &info.preds {
                send_reach(map, comm, pred, label, vtx, Direction::Backward);
            }
            for &succ in &info.succs {
                send_reach(map, comm, succ, label, vtx, Direction::Forward);
            }
        });
        comm.barrier();
    }

    /// Removes every edge whose endpoints disagree on the reachability
    /// quadrant `(mark_pred, mark_desc)`. Both mirror sides go: the head
    /// drops the tail from its predecessors and sends the tail a visit
    /// dropping the head from its successors.
    fn shear_edges(&self, comm: &Comm) {
        let map = &self.map;
        self.map.local_for_all(comm, |vtx, info| {
            if !info.active {
                return;
            }
            let tail_pred = info.mark_pred;
            let tail_desc = info.mark_desc;
            for &succ in &info.succs {
                let map_reply = Arc::clone(map);
                map.async_visit(comm, succ, move |comm, head, head_info| {
                    if !head_info.active {
                        return;
                    }
                    if head_info.mark_pred != tail_pred || head_info.mark_desc != tail_desc {
                        head_info.preds.remove(&vtx);
                        map_reply.async_visit(comm, vtx, move |_comm, _tail, tail_info| {
                            tail_info.succs.remove(&head);
                        });
                    }
                });
            }
        });
        comm.barrier();
    }

    /// Retires every doubly-marked vertex into its pivot's component and
    /// clears the iteration scratch of the rest. Returns the global number
    /// of vertices that were still active on entry; zero means convergence.
    fn freeze_and_reset(&self, comm: &Comm) -> u64 {
        let mut unterminated = 0u64;
        self.map.local_for_all(comm, |_vtx, info| {
            if !info.active {
                return;
            }
            unterminated += 1;
            if info.mark_pred && info.mark_desc {
                let marker = info.marker.expect("a reached vertex records its pivot");
                info.retire(marker);
            } else {
                info.reset_scratch();
            }
        });
        comm.all_sum(unterminated)
    }
}

fn send_trim(
    map: &Arc<VertexMap>,
    comm: &Comm,
    target: VertexId,
    sender: VertexId,
    dir: Direction,
) {
    let map_inner = Arc::clone(map);
    map.async_visit(comm, target, move |comm, vtx, info| {
        on_trim(&map_inner, comm, vtx, info, sender, dir);
    });
}

/// Trim delivery: the retiring `sender` withdrew the shared edge; if that
/// empties either side here, this vertex retires too and the peel cascades.
fn on_trim(
    map: &Arc<VertexMap>,
    comm: &Comm,
    vtx: VertexId,
    info: &mut VertexInfo,
    sender: VertexId,
    dir: Direction,
) {
    if !info.active {
        return;
    }
    match dir {
        Direction::Forward => {
            info.preds.remove(&sender);
        }
        Direction::Backward => {
            info.succs.remove(&sender);
        }
    }

    if info.preds.is_empty() {
        info.retire(vtx);
        for &succ in &info.succs {
            send_trim(map, comm, succ, vtx, Direction::Forward);
        }
        info.succs.clear();
    } else if info.succs.is_empty() {
        info.retire(vtx);
        for &pred in &info.preds {
            send_trim(map, comm, pred, vtx, Direction::Backward);
        }
        info.preds.clear();
    }
}

/// Pops one pending broadcast and, if its label still stands, sends it to
/// the vertex's whole neighborhood. Registered as a pre-barrier callback,
/// once per queue push.
fn broadcast_next(map: &Arc<VertexMap>, queues: &Arc<PivotQueues>, comm: &Comm) {
    let popped = queues[comm.rank()].lock().unwrap().pop();
    let Some(Reverse((label, vtx))) = popped else {
        return;
    };

    map.local_visit(comm, vtx, |comm, _vtx, info| {
        if info.wcc_pivot != Some(label) {
            return;
        }
        for &nbr in info.succs.iter().chain(info.preds.iter()) {
            send_label(map, queues, comm, nbr, label);
        }
    });
}

/// Label delivery: adopt a strictly smaller subproblem label, queue it for
/// re-broadcast, and keep the barrier open with a fresh callback.
fn send_label(
    map: &Arc<VertexMap>,
    queues: &Arc<PivotQueues>,
    comm: &Comm,
    target: VertexId,
    label: VertexId,
) {
    let map_inner = Arc::clone(map);
    let queues_inner = Arc::clone(queues);
    map.async_visit(comm, target, move |comm, vtx, info| {
        if !info.active {
            return;
        }
        if info.wcc_pivot.map_or(true, |current| label < current) {
            info.wcc_pivot = Some(label);
            queues_inner[comm.rank()]
                .lock()
                .unwrap()
                .push(Reverse((label, vtx)));
            comm.register_pre_barrier_callback(move |comm| {
                broadcast_next(&map_inner, &queues_inner, comm)
            });
        }
    });
}

fn send_reach(
    map: &Arc<VertexMap>,
    comm: &Comm,
    target: VertexId,
    label: VertexId,
    marker: VertexId,
    dir: Direction,
) {
    let map_inner = Arc::clone(map);
    map.async_visit(comm, target, move |comm, vtx, info| {
        on_reach(&map_inner, comm, vtx, info, label, marker, dir);
    });
}

/// Reach delivery: spread a pivot's mark through its own subproblem. The
/// mark doubles as the visited flag, so every vertex forwards at most once
/// per direction; visits that land late or outside the subproblem are
/// silently dropped.
fn on_reach(
    map: &Arc<VertexMap>,
    comm: &Comm,
    _vtx: VertexId,
    info: &mut VertexInfo,
    label: VertexId,
    marker: VertexId,
    dir: Direction,
) {
    if !info.active {
        return;
    }
    match dir {
        Direction::Forward => {
            if info.mark_desc || info.wcc_pivot != Some(label) {
                return;
            }
            info.mark_desc = true;
            info.marker = Some(marker);
            for &succ in &info.succs {
                send_reach(map, comm, succ, label, marker, Direction::Forward);
            }
        }
        Direction::Backward => {
            if info.mark_pred || info.wcc_pivot != Some(label) {
                return;
            }
            info.mark_pred = true;
            info.marker = Some(marker);
            for &pred in &info.preds {
                send_reach(map, comm, pred, label, marker, Direction::Backward);
            }
        }
    }
}

#[cfg(test)]
mod test_dcsc {
    use std::collections::HashSet;
    use std::sync::Arc;

    use rustc_hash::FxHashMap;

    use super::*;
    use crate::algorithms::analysis;
    use crate::comm::World;
    use crate::graph;

    /// Builds the graph, runs the solver to convergence at the given rank
    /// count, checks the global coherence every run must exhibit, and
    /// returns the component label of every vertex.
    fn run_scc(edges: &[(VertexId, VertexId)], num_ranks: usize) -> FxHashMap<VertexId, VertexId> {
        let world = World::new(num_ranks);
        let map = Arc::new(VertexMap::new(num_ranks));
        let solver = SccSolver::new(Arc::clone(&map), SccConfig::default());

        world.run(|comm| {
            graph::build_from_edges(comm, &map, edges);
            let iterations = solver.solve(comm);
            assert!(iterations >= 1);
        });

        assert!(analysis::mirror_intact(&map));
        let records = map.collect_all(|vtx, info| (vtx, info.clone()));
        for (vtx, info) in &records {
            assert!(!info.active, "vertex {vtx} left unterminated");
            assert!(
                info.comp_id.is_some(),
                "vertex {vtx} retired without a component"
            );
        }
        records
            .into_iter()
            .map(|(vtx, info)| (vtx, info.comp_id.unwrap()))
            .collect()
    }

    /// Asserts that the labeling groups vertices exactly as `expected`:
    /// one shared label per group, distinct labels across groups, and each
    /// label drawn from its own group.
    fn assert_partition(components: &FxHashMap<VertexId, VertexId>, expected: &[&[VertexId]]) {
        let total: usize = expected.iter().map(|group| group.len()).sum();
        assert_eq!(components.len(), total);

        let mut labels = HashSet::new();
        for group in expected {
            let label = components[&group[0]];
            for vtx in group.iter() {
                assert_eq!(components[vtx], label, "vertex {vtx} strayed from its group");
            }
            assert!(labels.insert(label), "label {label} shared across groups");
            assert!(group.contains(&label), "label {label} from outside the group");
        }
    }

    fn solve_at_all_rank_counts(
        edges: &[(VertexId, VertexId)],
        expected: &[&[VertexId]],
    ) -> FxHashMap<VertexId, VertexId> {
        let at_one = run_scc(edges, 1);
        assert_partition(&at_one, expected);
        for num_ranks in [2, 4] {
            let other = run_scc(edges, num_ranks);
            assert_eq!(at_one, other, "labels diverged at {num_ranks} ranks");
        }
        at_one
    }

    #[test]
    fn test_single_edge_splits_into_two_components() {
        let components = solve_at_all_rank_counts(&[(1, 2)], &[&[1], &[2]]);
        // Both ends peel as trivial components under their own names.
        assert_eq!(components[&1], 1);
        assert_eq!(components[&2], 2);
    }

    #[test]
    fn test_triangle_cycle_is_one_component() {
        solve_at_all_rank_counts(&[(1, 2), (2, 3), (3, 1)], &[&[1, 2, 3]]);
    }

    #[test]
    fn test_disjoint_cycles_stay_apart() {
        solve_at_all_rank_counts(&[(1, 2), (2, 1), (3, 4), (4, 3)], &[&[1, 2], &[3, 4]]);
    }

    #[test]
    fn test_chain_into_cycle() {
        let components =
            solve_at_all_rank_counts(&[(1, 2), (2, 3), (3, 4), (4, 2)], &[&[1], &[2, 3, 4]]);
        assert_eq!(components[&1], 1);
    }

    #[test]
    fn test_self_loop_is_its_own_component() {
        let components = solve_at_all_rank_counts(&[(1, 1)], &[&[1]]);
        assert_eq!(components[&1], 1);
    }

    #[test]
    fn test_dag_dissolves_into_singletons() {
        let components = solve_at_all_rank_counts(
            &[(1, 2), (1, 3), (2, 4), (3, 4)],
            &[&[1], &[2], &[3], &[4]],
        );
        for vtx in 1..=4 {
            assert_eq!(components[&vtx], vtx);
        }
    }

    /// Two cycles joined by a bridge plus a dangling tail: the first
    /// iteration extracts one cycle and shears the bridge, the next
    /// extracts the other.
    #[test]
    fn test_bridged_cycles_need_multiple_iterations() {
        let edges = [
            (1, 2),
            (2, 3),
            (3, 1),
            (3, 4),
            (4, 5),
            (5, 4),
            (5, 6),
        ];
        let components = solve_at_all_rank_counts(&edges, &[&[1, 2, 3], &[4, 5], &[6]]);
        // The tail has no out-edges and peels under its own name.
        assert_eq!(components[&6], 6);
    }

    #[test]
    fn test_census_of_a_solved_graph() {
        let world = World::new(2);
        let map = Arc::new(VertexMap::new(2));
        let solver = SccSolver::new(Arc::clone(&map), SccConfig::default());

        world.run(|comm| {
            graph::build_from_edges(comm, &map, &[(1, 2), (2, 1), (3, 4)]);
            solver.solve(comm);
        });

        let census = analysis::component_census(&map);
        assert_eq!(census.component_count, 3);
        assert_eq!(census.largest_component, 2);
        assert_eq!(census.singleton_count, 2);
    }

    #[test]
    fn test_trim_is_idempotent() {
        let world = World::new(2);
        let map = Arc::new(VertexMap::new(2));
        let solver = SccSolver::new(Arc::clone(&map), SccConfig::default());

        world.run(|comm| {
            graph::build_from_edges(comm, &map, &[(1, 2), (2, 3), (3, 4), (4, 2)]);
            solver.trim(comm);
        });

        let snapshot = |map: &VertexMap| {
            let mut records = map.collect_all(|vtx, info| (vtx, info.clone()));
            records.sort_by_key(|(vtx, _)| *vtx);
            records
        };
        let after_first = snapshot(&map);

        // The chain head is peeled, the cycle stays whole.
        let head = map.get_cloned(1).unwrap();
        assert!(!head.active);
        assert_eq!(head.comp_id, Some(1));
        for vtx in 2..=4 {
            assert!(map.get_cloned(vtx).unwrap().active);
        }
        assert!(analysis::mirror_intact(&map));

        world.run(|comm| solver.trim(comm));
        assert_eq!(after_first, snapshot(&map));
    }

    /// After subproblem assignment, every weakly connected piece agrees on
    /// the smallest permuted identity among its members, and only the
    /// vertex that drew it is the pivot.
    #[test]
    fn test_subproblem_labels_are_piecewise_minima() {
        let world = World::new(4);
        let map = Arc::new(VertexMap::new(4));
        let solver = SccSolver::new(Arc::clone(&map), SccConfig::default());
        let pieces: [&[VertexId]; 2] = [&[1, 2, 3], &[5, 6]];

        world.run(|comm| {
            graph::build_from_edges(comm, &map, &[(1, 2), (2, 3), (5, 6), (6, 5)]);
            let (min_id, max_id) = graph::id_range(comm, &map);
            solver.assign_subproblems(comm, 0, min_id, max_id);
        });

        let perm = Permuter::new(1, 6, SccConfig::default().seed);
        for piece in pieces {
            let expected = piece.iter().map(|&vtx| perm.permute(vtx)).min();
            let mut pivots = 0;
            for &vtx in piece {
                let info = map.get_cloned(vtx).unwrap();
                assert_eq!(info.wcc_pivot, expected);
                assert_eq!(info.pivot, Some(perm.permute(vtx)));
                if info.is_pivot() {
                    pivots += 1;
                }
            }
            assert_eq!(pivots, 1, "a piece elects exactly one pivot");
        }
    }
}
