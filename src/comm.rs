use std::collections::VecDeque;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::stats::{MessageStats, TrafficSource};

pub mod dist_map;

/// An asynchronous visit on its way to the owning rank. Envelopes carry
/// everything they need; the receiving rank only supplies its own `Comm`.
type Envelope = Box<dyn FnOnce(&Comm) + Send + 'static>;

/// A one-shot closure the barrier runs before it is allowed to complete.
type PreBarrierCallback = Box<dyn FnOnce(&Comm) + Send + 'static>;

/// Shared barrier bookkeeping. `in_flight` counts envelopes that have been
/// sent but not yet executed; `idle` counts ranks that found nothing left to
/// do; `epoch` advances each time a barrier completes.
struct BarrierState {
    in_flight: u64,
    idle: usize,
    epoch: u64,
    poisoned: Option<usize>,
}

struct WorldShared {
    num_ranks: usize,
    mailboxes: Vec<Mutex<VecDeque<Envelope>>>,
    callbacks: Vec<Mutex<VecDeque<PreBarrierCallback>>>,
    state: Mutex<BarrierState>,
    quiet: Condvar,
    reduce_slots: Mutex<Vec<u64>>,
    sent: AtomicU64,
    delivered: AtomicU64,
}

/// A fixed set of peer ranks executing the same program, message-driven.
///
/// Each rank runs on its own OS thread and owns one partition of every
/// distributed container. Cross-rank work travels as envelopes to per-rank
/// mailboxes; a rank executes its envelopes one at a time, so handlers on
/// the same rank never race each other and no per-record locking discipline
/// is needed beyond the container's own.
///
/// # Example
///
/// let world = World::new(4);
/// world.run(|comm| {
///     let total = comm.all_sum(comm.rank() as u64);
///     assert_eq!(total, 6);
/// });
///
pub struct World {
    shared: Arc<WorldShared>,
}

impl World {
    pub fn new(num_ranks: usize) -> Self {
        assert!(num_ranks >= 1, "a world needs at least one rank");
        World {
            shared: Arc::new(WorldShared {
                num_ranks,
                mailboxes: (0..num_ranks).map(|_| Mutex::new(VecDeque::new())).collect(),
                callbacks: (0..num_ranks).map(|_| Mutex::new(VecDeque::new())).collect(),
                state: Mutex::new(BarrierState {
                    in_flight: 0,
                    idle: 0,
                    epoch: 0,
                    poisoned: None,
                }),
                quiet: Condvar::new(),
                reduce_slots: Mutex::new(vec![0; num_ranks]),
                sent: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
            }),
        }
    }

    pub fn num_ranks(&self) -> usize {
        self.shared.num_ranks
    }

    /// Runs `body` once per rank, each on its own thread, and joins them.
    ///
    /// A trailing barrier runs after the body so that a region whose last
    /// action was asynchronous still drains before the threads exit. If any
    /// rank panics the world is poisoned: every other rank panics out of its
    /// barrier instead of hanging, and the panic propagates to the caller.
    pub fn run<F>(&self, body: F)
    where
        F: Fn(&Comm) + Sync,
    {
        thread::scope(|scope| {
            for rank in 0..self.shared.num_ranks {
                let shared = Arc::clone(&self.shared);
                let body = &body;
                scope.spawn(move || {
                    let comm = Comm { rank, shared };
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        body(&comm);
                        comm.barrier();
                    }));
                    if let Err(payload) = outcome {
                        comm.poison();
                        resume_unwind(payload);
                    }
                });
            }
        });
    }
}

impl TrafficSource for World {
    fn message_stats(&self) -> MessageStats {
        MessageStats {
            sent: self.shared.sent.load(Ordering::Relaxed),
            delivered: self.shared.delivered.load(Ordering::Relaxed),
        }
    }
}

/// A rank's handle to the world. One per rank thread; handlers receive the
/// handle of the rank executing them.
pub struct Comm {
    rank: usize,
    shared: Arc<WorldShared>,
}

impl Comm {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_ranks(&self) -> usize {
        self.shared.num_ranks
    }

    /// Enqueues an envelope on `dest`'s mailbox. The in-flight count rises
    /// before the envelope becomes visible, so the barrier can never observe
    /// a quiet world while a send is midway.
    pub(crate) fn send(&self, dest: usize, envelope: Envelope) {
        {
            let mut st = self.shared.state.lock().unwrap();
            st.in_flight += 1;
        }
        self.shared.mailboxes[dest].lock().unwrap().push_back(envelope);
        self.shared.sent.fetch_add(1, Ordering::Relaxed);
        // Taking the state lock orders this wakeup after any idle vote in
        // progress, closing the lost-wakeup window.
        let _st = self.shared.state.lock().unwrap();
        self.shared.quiet.notify_all();
    }

    /// Queues a closure the next barrier must run before it may complete.
    /// Callbacks run on the registering rank, may send envelopes, and may
    /// register further callbacks; the barrier cycles until none remain
    /// anywhere and no envelope is in flight.
    pub fn register_pre_barrier_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Comm) + Send + 'static,
    {
        self.shared.callbacks[self.rank]
            .lock()
            .unwrap()
            .push_back(Box::new(callback));
    }

    fn deliver_one(&self) -> bool {
        let envelope = self.shared.mailboxes[self.rank].lock().unwrap().pop_front();
        match envelope {
            Some(envelope) => {
                envelope(self);
                self.shared.delivered.fetch_add(1, Ordering::Relaxed);
                self.shared.state.lock().unwrap().in_flight -= 1;
                true
            }
            None => false,
        }
    }

    fn next_callback(&self) -> Option<PreBarrierCallback> {
        self.shared.callbacks[self.rank].lock().unwrap().pop_front()
    }

    /// Blocks until every rank has entered the barrier, every envelope has
    /// been delivered and executed, and every pre-barrier callback has run.
    ///
    /// The protocol is an idle-vote fixpoint: a rank drains its mailbox,
    /// interleaves one callback per round so freshly provoked envelopes are
    /// applied promptly, and votes idle once it is locally quiet. The last
    /// rank to vote while nothing is in flight closes the epoch. New mail
    /// retracts a rank's vote.
    pub fn barrier(&self) {
        let shared = &self.shared;
        loop {
            while self.deliver_one() {}

            if let Some(callback) = self.next_callback() {
                callback(self);
                continue;
            }

            let mut st = shared.state.lock().unwrap();
            self.check_poison(&st);
            if !shared.mailboxes[self.rank].lock().unwrap().is_empty()
                || !shared.callbacks[self.rank].lock().unwrap().is_empty()
            {
                // Work arrived between the drain and the vote.
                continue;
            }

            st.idle += 1;
            if st.idle == shared.num_ranks && st.in_flight == 0 {
                st.epoch = st.epoch.wrapping_add(1);
                st.idle = 0;
                shared.quiet.notify_all();
                return;
            }

            let arrival_epoch = st.epoch;
            loop {
                st = shared.quiet.wait(st).unwrap();
                self.check_poison(&st);
                if st.epoch != arrival_epoch {
                    return;
                }
                if !shared.mailboxes[self.rank].lock().unwrap().is_empty() {
                    st.idle -= 1;
                    break;
                }
            }
        }
    }

    /// Collective sum over one `u64` per rank. Must be called by all ranks.
    pub fn all_sum(&self, value: u64) -> u64 {
        self.all_reduce(value, |a, b| a + b)
    }

    /// Collective minimum over one `u64` per rank.
    pub fn all_min(&self, value: u64) -> u64 {
        self.all_reduce(value, u64::min)
    }

    /// Collective maximum over one `u64` per rank.
    pub fn all_max(&self, value: u64) -> u64 {
        self.all_reduce(value, u64::max)
    }

    fn all_reduce<F>(&self, value: u64, combine: F) -> u64
    where
        F: Fn(u64, u64) -> u64,
    {
        self.shared.reduce_slots.lock().unwrap()[self.rank] = value;
        self.barrier();
        let combined = {
            let slots = self.shared.reduce_slots.lock().unwrap();
            slots
                .iter()
                .copied()
                .reduce(&combine)
                .expect("a world has at least one rank")
        };
        // Hold everyone until all reads finish, so a subsequent collective
        // cannot overwrite the slots early.
        self.barrier();
        combined
    }

    fn check_poison(&self, st: &BarrierState) {
        if let Some(origin) = st.poisoned {
            panic!("world poisoned by a panic on rank {origin}");
        }
    }

    fn poison(&self) {
        let mut st = self.shared.state.lock().unwrap();
        st.poisoned = Some(self.rank);
        self.shared.quiet.notify_all();
    }
}

impl TrafficSource for Comm {
    fn message_stats(&self) -> MessageStats {
        MessageStats {
            sent: self.shared.sent.load(Ordering::Relaxed),
            delivered: self.shared.delivered.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::TrafficSource;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    const RELAY_HOPS: u64 = 10;

    /// A handler that sends from within a handler must still be drained
    /// before the barrier lets anyone through.
    #[test]
    fn test_chained_visits_drain_before_barrier() {
        let world = World::new(3);
        let hits = Arc::new(AtomicU64::new(0));

        world.run(|comm| {
            if comm.rank() == 0 {
                let hits = Arc::clone(&hits);
                comm.send(
                    1,
                    Box::new(move |comm| {
                        let hits_inner = Arc::clone(&hits);
                        hits.fetch_add(1, Ordering::SeqCst);
                        comm.send(
                            2,
                            Box::new(move |_comm| {
                                hits_inner.fetch_add(1, Ordering::SeqCst);
                            }),
                        );
                    }),
                );
            }
            comm.barrier();
            assert_eq!(hits.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn test_collectives_agree_across_ranks() {
        let world = World::new(4);
        world.run(|comm| {
            let rank = comm.rank() as u64;
            assert_eq!(comm.all_sum(rank), 6);
            assert_eq!(comm.all_min(rank), 0);
            assert_eq!(comm.all_max(rank), 3);
            // Back-to-back collectives must not trample each other's slots.
            assert_eq!(comm.all_sum(1), comm.num_ranks() as u64);
        });
    }

    /// A relay where every hop is produced by a pre-barrier callback: the
    /// callback sends an envelope, whose handler registers the next
    /// callback on the receiving rank. The barrier may only complete after
    /// the whole chain has run.
    #[test]
    fn test_pre_barrier_callbacks_keep_barrier_open() {
        fn relay(comm: &Comm, hops: Arc<AtomicU64>) {
            let done = hops.fetch_add(1, Ordering::SeqCst) + 1;
            if done >= RELAY_HOPS {
                return;
            }
            let dest = (comm.rank() + 1) % comm.num_ranks();
            comm.send(
                dest,
                Box::new(move |comm| {
                    comm.register_pre_barrier_callback(move |comm| relay(comm, hops));
                }),
            );
        }

        let world = World::new(4);
        let hops = Arc::new(AtomicU64::new(0));
        world.run(|comm| {
            if comm.rank() == 0 {
                let hops = Arc::clone(&hops);
                comm.register_pre_barrier_callback(move |comm| relay(comm, hops));
            }
            comm.barrier();
            assert_eq!(hops.load(Ordering::SeqCst), RELAY_HOPS);
        });
    }

    #[test]
    fn test_world_is_reusable_across_regions() {
        let world = World::new(2);
        let count = Arc::new(AtomicU64::new(0));

        for _ in 0..2 {
            world.run(|comm| {
                if comm.rank() == 1 {
                    let count = Arc::clone(&count);
                    comm.send(
                        0,
                        Box::new(move |_comm| {
                            count.fetch_add(1, Ordering::SeqCst);
                        }),
                    );
                }
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);

        let stats = world.message_stats();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.in_flight(), 0);
    }

    #[test]
    #[should_panic]
    fn test_panicking_rank_poisons_world() {
        let world = World::new(3);
        world.run(|comm| {
            if comm.rank() == 1 {
                panic!("handler went wrong");
            }
            // The other ranks sit in a barrier; poison must free them.
            comm.barrier();
        });
    }
}
