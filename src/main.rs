use std::fs::File;
use std::process;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use log::info;
use memmap2::Mmap;
use serde::Serialize;

use disco::algorithms::analysis;
use disco::algorithms::dcsc::{SccConfig, SccSolver};
use disco::comm::World;
use disco::config;
use disco::graph::{self, VertexMap};
use disco::measure_phase;
use disco::util::human_count;

#[derive(Parser, Debug, Serialize)]
#[command(author, version, about)]
struct Args {
    /// Path of the edge-list file (one `src dst` pair per line, `#` comments).
    edge_list: String,

    /// Number of simulated ranks holding graph partitions.
    #[arg(short, long, default_value_t = config::DEFAULT_RANK_COUNT)]
    ranks: usize,

    /// Base seed for the per-iteration pivot permutation.
    #[arg(short, long, default_value_t = config::PIVOT_SEED_BASE)]
    seed: u64,
}

fn main() {
    env_logger::init();

    let args = Args::try_parse().unwrap_or_else(|err| {
        let code = if err.use_stderr() { 1 } else { 0 };
        let _ = err.print();
        process::exit(code);
    });
    if args.ranks == 0 {
        eprintln!("--ranks must be at least 1");
        process::exit(1);
    }

    let file = File::open(&args.edge_list).unwrap_or_else(|err| {
        eprintln!("cannot open {}: {}", args.edge_list, err);
        process::exit(1);
    });
    // Zero-length files cannot be mapped; treat them as an empty edge list.
    let mapped = match file.metadata() {
        Ok(meta) if meta.len() == 0 => None,
        _ => Some(unsafe { Mmap::map(&file) }.unwrap_or_else(|err| {
            eprintln!("cannot map {}: {}", args.edge_list, err);
            process::exit(1);
        })),
    };
    let data: &[u8] = mapped.as_deref().unwrap_or(&[]);

    let world = World::new(args.ranks);
    let map = Arc::new(VertexMap::new(args.ranks));
    let solver = SccSolver::new(Arc::clone(&map), SccConfig { seed: args.seed });

    // One SPMD region covers the whole pipeline: every rank ingests its
    // share of the edge list, then all of them drive the solver together.
    let start = Instant::now();
    measure_phase!(world, "ingest + solve", {
        world.run(|comm| {
            let (vertex_count, edge_count) = graph::load_edge_list(comm, &map, data);
            if comm.rank() == 0 {
                info!("Node Count: {}", human_count(vertex_count));
                info!("Edge Count: {}", human_count(edge_count));
            }

            let iterations = solver.solve(comm);
            if comm.rank() == 0 {
                info!("Converged after {} iterations", iterations);
            }
        });
    });
    let duration = start.elapsed();

    let census = analysis::component_census(&map);
    println!("SCC Count: {}", human_count(census.component_count));
    println!("Largest SCC: {}", human_count(census.largest_component));
    println!("Trivial SCCs: {}", human_count(census.singleton_count));
    println!("SCC Elapsed Time: {:?} us", duration.as_micros());
}
