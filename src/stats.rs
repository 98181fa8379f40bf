// Visit-traffic statistics toolkit.
use std::fmt;
use std::time::{Duration, Instant};

/// Snapshot of the world's visit traffic.
///
/// The counters are lifetime totals: `sent` counts every envelope handed to
/// a mailbox, `delivered` counts every envelope a rank has executed. The
/// difference between two snapshots brackets the traffic a block of work
/// generated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageStats {
    pub sent: u64,
    pub delivered: u64,
}

impl MessageStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Traffic accumulated since an earlier snapshot. Saturating, so a
    /// stale baseline cannot underflow.
    pub fn diff(&self, earlier: &MessageStats) -> MessageStats {
        MessageStats {
            sent: self.sent.saturating_sub(earlier.sent),
            delivered: self.delivered.saturating_sub(earlier.delivered),
        }
    }

    /// Envelopes sitting in mailboxes right now. Zero at every barrier.
    pub fn in_flight(&self) -> u64 {
        self.sent.saturating_sub(self.delivered)
    }

    pub fn has_traffic(&self) -> bool {
        self.sent > 0 || self.delivered > 0
    }
}

impl fmt::Display for MessageStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Visit Traffic: {} sent, {} delivered, {} in flight",
            self.sent,
            self.delivered,
            self.in_flight()
        )
    }
}

/// Source of traffic snapshots. Implemented by the world and by per-rank
/// handles so that measurement works from either side of an SPMD region.
pub trait TrafficSource {
    fn message_stats(&self) -> MessageStats;
}

/// Result of measuring a block: its return value, wall time, and the
/// traffic it generated.
pub struct PhaseReport<T> {
    pub result: T,
    pub duration: Duration,
    pub traffic: MessageStats,
}

impl<T> PhaseReport<T> {
    /// Logs a one-line summary of the measured block.
    pub fn log_summary(&self, name: &str) {
        log::info!(
            "{}: {:?}, {} visits delivered",
            name,
            self.duration,
            self.traffic.delivered
        );
    }
}

/// Measures a block of work against a traffic source.
pub struct PhaseMeter;

impl PhaseMeter {
    /// Runs `f`, recording wall time and the sent/delivered delta around it.
    pub fn measure<S, F, R>(source: &S, f: F) -> PhaseReport<R>
    where
        S: TrafficSource,
        F: FnOnce() -> R,
    {
        let before = source.message_stats();
        let start = Instant::now();

        let result = f();

        let duration = start.elapsed();
        let traffic = source.message_stats().diff(&before);

        PhaseReport {
            result,
            duration,
            traffic,
        }
    }

    /// Measures `f` and immediately logs the summary line.
    pub fn measure_and_log<S, F, R>(source: &S, name: &str, f: F) -> R
    where
        S: TrafficSource,
        F: FnOnce() -> R,
    {
        let report = Self::measure(source, f);
        report.log_summary(name);
        report.result
    }
}

/// Convenience macro wrapping a block in a [`PhaseMeter`] measurement with
/// automatic summary logging.
///
/// # Arguments
/// - `$source`: expression yielding a [`TrafficSource`] (a world or a comm).
/// - `$name`: operation name for the summary line.
/// - `$code`: the block to measure.
///
/// # Returns
/// The value of the measured block.
#[macro_export]
macro_rules! measure_phase {
    ($source:expr, $name:expr, $code:block) => {{
        $crate::stats::PhaseMeter::measure_and_log(&$source, $name, || $code)
    }};
}
