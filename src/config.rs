/// Number of simulated ranks when the command line does not say otherwise.
pub const DEFAULT_RANK_COUNT: usize = 4;

/// Base seed for the per-iteration pivot permutation. The driver adds the
/// iteration number so that every round draws a fresh permutation while all
/// ranks agree on it without coordination. The constant is the 64-bit golden
/// ratio, the usual choice for seeding a SplitMix64-style mixer.
pub const PIVOT_SEED_BASE: u64 = 0x9E3779B97F4A7C15;

/// Template for the ingest progress bar shown on rank 0.
pub const INGEST_BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}";
