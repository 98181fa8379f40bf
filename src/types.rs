use rustc_hash::FxHashSet;

/// Vertex identifiers are 32-bit. The ingest path shifts raw file ids up by
/// one so that 0 never names a real vertex.
pub type VertexId = u32;

/// The per-vertex record of the distributed store. This is the only state
/// the solver's phases touch; every phase is a pattern of visits to it.
///
/// # Fields
///
/// * `succs` / `preds` - distinct out- and in-neighbors. The two sides
///   mirror each other: `u ∈ v.preds` exactly when `v ∈ u.succs`, and every
///   edge removal keeps it that way.
/// * `comp_id` - final component label, `None` until the vertex is retired.
/// * `active` - whether the vertex still participates in upcoming phases.
///   A vertex is retired exactly when its component label is known.
/// * `pivot` - the permuted identity drawn for the current iteration.
/// * `wcc_pivot` - smallest permuted identity seen so far by the label
///   diffusion; names the subproblem this vertex currently belongs to.
/// * `marker` - identity of the pivot vertex whose reachability sweep
///   touched this vertex in the current iteration.
/// * `mark_pred` / `mark_desc` - reached backward (ancestor of the pivot) /
///   forward (descendant of the pivot) in the current iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct VertexInfo {
    pub succs: FxHashSet<VertexId>,
    pub preds: FxHashSet<VertexId>,

    pub comp_id: Option<VertexId>,
    pub active: bool,

    pub pivot: Option<VertexId>,
    pub wcc_pivot: Option<VertexId>,
    pub marker: Option<VertexId>,

    pub mark_pred: bool,
    pub mark_desc: bool,
}

impl Default for VertexInfo {
    /// A fresh vertex is active, unlabeled and edge-free. Visits to keys the
    /// store has never seen create records through this impl.
    fn default() -> Self {
        VertexInfo {
            succs: FxHashSet::default(),
            preds: FxHashSet::default(),
            comp_id: None,
            active: true,
            pivot: None,
            wcc_pivot: None,
            marker: None,
            mark_pred: false,
            mark_desc: false,
        }
    }
}

impl VertexInfo {
    /// Assigns the component label and withdraws the vertex from all future
    /// phases. Retirement is final.
    pub fn retire(&mut self, comp: VertexId) {
        debug_assert!(self.active, "retiring a vertex twice");
        self.comp_id = Some(comp);
        self.active = false;
    }

    /// Clears the per-iteration scratch fields back to their sentinel state.
    pub fn reset_scratch(&mut self) {
        self.pivot = None;
        self.wcc_pivot = None;
        self.marker = None;
        self.mark_pred = false;
        self.mark_desc = false;
    }

    /// A vertex leads its subproblem when the diffusion left it holding its
    /// own permuted identity as the subproblem label.
    pub fn is_pivot(&self) -> bool {
        self.pivot.is_some() && self.pivot == self.wcc_pivot
    }
}
