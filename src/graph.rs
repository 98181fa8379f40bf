use indicatif::{ProgressBar, ProgressStyle};
use log::debug;

use crate::comm::dist_map::DistMap;
use crate::comm::Comm;
use crate::config::INGEST_BAR_TEMPLATE;
use crate::types::{VertexId, VertexInfo};

/// The distributed vertex store: one record per vertex, partitioned by rank.
pub type VertexMap = DistMap<VertexInfo>;

/// Loads a whitespace-separated `src dst` edge list into the vertex map.
///
/// Collective: every rank parses the lines that begin inside its byte range
/// of `data` (an mmap'ed file or any in-memory buffer) and ships one visit
/// per edge endpoint, so both mirror sides of each edge are recorded on
/// their owners. `#`-prefixed lines and blank lines are skipped; malformed
/// lines are dropped with a debug log. Raw ids are shifted up by one so id 0
/// never names a real vertex.
///
/// Rank 0 drives a progress bar over its own chunk.
///
/// # Returns
/// Global `(vertex_count, edge_count)` after the closing barrier.
pub fn load_edge_list(comm: &Comm, map: &VertexMap, data: &[u8]) -> (u64, u64) {
    let (start, end) = chunk_bounds(data, comm.rank(), comm.num_ranks());

    let bar = if comm.rank() == 0 && end > start {
        let pb = ProgressBar::new((end - start) as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(INGEST_BAR_TEMPLATE)
                .expect("ingest bar template")
                .progress_chars("=>-"),
        );
        pb.set_message("Ingesting edge list.");
        Some(pb)
    } else {
        None
    };

    let mut local_edges = 0u64;
    let mut cursor = start;
    while cursor < end {
        let line_end = data[cursor..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|offset| cursor + offset)
            .unwrap_or(data.len());

        if let Some((src, dst)) = parse_edge(&data[cursor..line_end]) {
            add_edge(comm, map, src, dst);
            local_edges += 1;
        }

        if let Some(pb) = &bar {
            pb.inc((line_end + 1 - cursor) as u64);
        }
        cursor = line_end + 1;
    }
    if let Some(pb) = &bar {
        pb.finish_and_clear();
    }

    comm.barrier();
    let edge_count = comm.all_sum(local_edges);
    (map.len() as u64, edge_count)
}

/// Builds a graph from an explicit edge slice, ids taken as-is.
/// Collective; rank 0 issues the visits, everyone meets at the barrier.
pub fn build_from_edges(comm: &Comm, map: &VertexMap, edges: &[(VertexId, VertexId)]) {
    if comm.rank() == 0 {
        for &(src, dst) in edges {
            add_edge(comm, map, src, dst);
        }
    }
    comm.barrier();
}

/// Collective scan for the smallest and largest vertex id in the map.
/// An empty map reports the inverted range `(u32::MAX, 0)`, which downstream
/// consumers treat as degenerate.
pub fn id_range(comm: &Comm, map: &VertexMap) -> (VertexId, VertexId) {
    let mut local_min = u64::from(u32::MAX);
    let mut local_max = 0u64;
    map.for_all(comm, |vtx, _info| {
        local_min = local_min.min(u64::from(vtx));
        local_max = local_max.max(u64::from(vtx));
    });

    let min_id = comm.all_min(local_min) as VertexId;
    let max_id = comm.all_max(local_max) as VertexId;
    (min_id, max_id)
}

fn add_edge(comm: &Comm, map: &VertexMap, src: VertexId, dst: VertexId) {
    map.async_visit(comm, src, move |_comm, _vtx, info| {
        info.succs.insert(dst);
    });
    map.async_visit(comm, dst, move |_comm, _vtx, info| {
        info.preds.insert(src);
    });
}

/// One parsed edge, already shifted into the reserved-zero id space.
/// Comments, blank lines and anything unparseable yield `None`.
fn parse_edge(line: &[u8]) -> Option<(VertexId, VertexId)> {
    let text = std::str::from_utf8(line).ok()?.trim();
    if text.is_empty() || text.starts_with('#') {
        return None;
    }

    let mut fields = text.split_whitespace();
    let parsed = (|| {
        let src: u32 = fields.next()?.parse().ok()?;
        let dst: u32 = fields.next()?.parse().ok()?;
        // Ids at the very top of the 32-bit space cannot be shifted.
        Some((src.checked_add(1)?, dst.checked_add(1)?))
    })();

    if parsed.is_none() {
        debug!("skipping malformed edge line: {text:?}");
    }
    parsed
}

/// Byte range of `data` whose lines belong to `rank`: a rank owns every
/// line that begins inside its slice of the even byte split.
fn chunk_bounds(data: &[u8], rank: usize, num_ranks: usize) -> (usize, usize) {
    let n = data.len();
    let lo = rank * n / num_ranks;
    let hi = (rank + 1) * n / num_ranks;
    (align_to_line_start(data, lo), align_to_line_start(data, hi))
}

fn align_to_line_start(data: &[u8], pos: usize) -> usize {
    if pos == 0 {
        return 0;
    }
    let mut p = pos;
    while p < data.len() && data[p - 1] != b'\n' {
        p += 1;
    }
    p
}
