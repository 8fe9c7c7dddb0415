//! Shared pipeline state
//!
//! [`PipelineContext`] is built once per run and handed to every component
//! constructor behind an `Arc`. It owns the in-memory queues, the shutdown
//! signals, the in-flight counter, the acknowledgment ledger, and the
//! durable writes waiting to be retried.

use crate::state::queue::BoundedQueue;
use crate::state::seed::{Item, Seed};
use crate::state::signal::{Flag, StopSignal};
use crate::storage::{DurableStore, StoreWrite};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

/// An item on its way to a sink, tagged with the attempt that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct Handoff {
    pub ticket: Ticket,
    pub seed: Seed,
    pub item: Item,
}

/// Everything the pipeline components share
pub struct PipelineContext {
    seeds: BoundedQueue<Seed>,
    sinks: HashMap<String, BoundedQueue<Handoff>>,
    stop: StopSignal,
    // Enqueues hold it shared; raising stop takes it exclusively
    enqueue_gate: RwLock<()>,
    drain: Flag,
    exhausted: Flag,
    in_flight: AtomicUsize,
    ledger: AckLedger,
    counters: PipelineCounters,
    deferred: Mutex<Vec<StoreWrite>>,
}

impl PipelineContext {
    /// Creates a context with one sink queue per destination
    pub fn new<I, S>(destinations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sinks = destinations
            .into_iter()
            .map(|d| (d.into(), BoundedQueue::new()))
            .collect();

        Self {
            seeds: BoundedQueue::new(),
            sinks,
            stop: StopSignal::new(),
            enqueue_gate: RwLock::new(()),
            drain: Flag::new(),
            exhausted: Flag::new(),
            in_flight: AtomicUsize::new(0),
            ledger: AckLedger::default(),
            counters: PipelineCounters::default(),
            deferred: Mutex::new(Vec::new()),
        }
    }

    // ===== Queues =====

    /// The in-memory seed buffer fed by dispatch and consumed by workers
    pub fn seeds(&self) -> &BoundedQueue<Seed> {
        &self.seeds
    }

    /// The pending-item buffer of one destination
    pub fn sink_queue(&self, destination: &str) -> Option<&BoundedQueue<Handoff>> {
        self.sinks.get(destination)
    }

    pub fn has_destination(&self, destination: &str) -> bool {
        self.sinks.contains_key(destination)
    }

    /// Destination names, sorted
    pub fn destinations(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sinks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Total items waiting across every sink queue
    pub fn sink_occupancy(&self) -> usize {
        self.sinks.values().map(BoundedQueue::len).sum()
    }

    /// Pushes seeds onto the seed buffer unless stop has been raised
    ///
    /// Returns false (and pushes nothing) after stop.
    pub fn enqueue_seeds(&self, seeds: Vec<Seed>) -> bool {
        let _open = read(&self.enqueue_gate);
        if self.stop.is_raised() {
            tracing::debug!("Stop raised, refusing {} seeds", seeds.len());
            return false;
        }
        self.seeds.push_batch(seeds);
        true
    }

    pub fn enqueue_seed(&self, seed: Seed) -> bool {
        self.enqueue_seeds(vec![seed])
    }

    /// Pushes items onto their destination queues, paired with their seed
    /// and the ledger ticket of the attempt that produced them
    ///
    /// Items whose destination has no queue are skipped and counted in the
    /// returned error. Nothing is pushed after stop.
    pub fn enqueue_items(
        &self,
        ticket: Ticket,
        seed: &Seed,
        items: Vec<Item>,
    ) -> Result<usize, usize> {
        let _open = read(&self.enqueue_gate);
        if self.stop.is_raised() {
            tracing::debug!("Stop raised, refusing {} items", items.len());
            return Err(items.len());
        }

        let mut pushed = 0;
        let mut unroutable = 0;
        for item in items {
            match self.sinks.get(&item.destination) {
                Some(queue) => {
                    queue.push(Handoff {
                        ticket,
                        seed: seed.clone(),
                        item,
                    });
                    pushed += 1;
                }
                None => unroutable += 1,
            }
        }

        if unroutable > 0 {
            Err(unroutable)
        } else {
            Ok(pushed)
        }
    }

    // ===== Signals =====

    pub fn stop(&self) -> &StopSignal {
        &self.stop
    }

    pub fn drain(&self) -> &Flag {
        &self.drain
    }

    /// Raised once no more upstream seeds can arrive
    pub fn exhausted(&self) -> &Flag {
        &self.exhausted
    }

    /// Raises stop once no enqueue is in progress
    ///
    /// After this returns, every queue only shrinks.
    pub fn raise_stop(&self) {
        let raised = {
            let _closed = match self.enqueue_gate.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            self.stop.raise()
        };
        if raised {
            tracing::info!("Stop raised");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_raised()
    }

    // ===== In-flight work =====

    /// Marks one worker as executing until the guard is dropped
    pub fn begin_work(&self) -> InFlightGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            counter: &self.in_flight,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn ledger(&self) -> &AckLedger {
        &self.ledger
    }

    pub fn counters(&self) -> &PipelineCounters {
        &self.counters
    }

    // ===== Durable writes =====

    /// Applies `write`; on failure keeps it for [`Self::retry_deferred`]
    ///
    /// Returns true if the write reached the store now.
    pub fn write_or_defer(&self, store: &dyn DurableStore, write: StoreWrite) -> bool {
        match write.apply(store) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    "Failed to {} {} seeds, will retry: {}",
                    write.kind(),
                    write.seeds().len(),
                    e
                );
                lock(&self.deferred).push(write);
                false
            }
        }
    }

    /// Replays deferred writes in order; returns how many are still pending
    pub fn retry_deferred(&self, store: &dyn DurableStore) -> usize {
        let mut deferred = lock(&self.deferred);
        if deferred.is_empty() {
            return 0;
        }
        let before = deferred.len();
        deferred.retain(|write| match write.apply(store) {
            Ok(()) => false,
            Err(e) => {
                tracing::debug!("Deferred {} still failing: {}", write.kind(), e);
                true
            }
        });
        if deferred.len() < before {
            tracing::info!("Replayed {} deferred store writes", before - deferred.len());
        }
        deferred.len()
    }

    /// Number of writes waiting to be replayed
    pub fn deferred_writes(&self) -> usize {
        lock(&self.deferred).len()
    }
}

/// Decrements the in-flight counter when dropped
///
/// Dropping happens on every exit path, unwinding included, so increments
/// and decrements always pair up.
pub struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let previous = self.counter.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "in-flight counter underflow");
    }
}

/// Identifies one successful extraction attempt in the [`AckLedger`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(u64);

/// Outstanding item counts per extraction attempt
///
/// A seed whose extraction produced items is acknowledged by the sinks, not
/// by the worker. The ledger makes sure that happens exactly once per
/// attempt: when the attempt's last item is persisted, or never if any batch
/// holding one of its items failed (the seed is reset instead). Items left
/// over from an abandoned attempt carry a dead ticket and settle nothing.
#[derive(Debug, Default)]
pub struct AckLedger {
    next: AtomicU64,
    pending: Mutex<HashMap<Ticket, usize>>,
}

impl AckLedger {
    /// Registers `count` items awaiting persistence for a new attempt
    pub fn register(&self, count: usize) -> Ticket {
        let ticket = Ticket(self.next.fetch_add(1, Ordering::Relaxed));
        if count > 0 {
            lock(&self.pending).insert(ticket, count);
        }
        ticket
    }

    /// Records one persisted item; returns true when it was the attempt's last
    pub fn settle(&self, ticket: Ticket) -> bool {
        let mut pending = lock(&self.pending);
        match pending.get_mut(&ticket) {
            Some(remaining) if *remaining > 1 => {
                *remaining -= 1;
                false
            }
            Some(_) => {
                pending.remove(&ticket);
                true
            }
            None => false,
        }
    }

    /// Forgets the attempt after a failed batch; returns true if it was pending
    pub fn abandon(&self, ticket: Ticket) -> bool {
        lock(&self.pending).remove(&ticket).is_some()
    }

    /// Number of attempts still waiting on their items
    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Run-wide outcome counters
#[derive(Debug, Default)]
pub struct PipelineCounters {
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    follow_ups: AtomicU64,
    items_stored: AtomicU64,
    batches_stored: AtomicU64,
    batches_failed: AtomicU64,
}

/// Point-in-time copy of [`PipelineCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub dispatched: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dropped: u64,
    pub follow_ups: u64,
    pub items_stored: u64,
    pub batches_stored: u64,
    pub batches_failed: u64,
}

impl PipelineCounters {
    pub fn record_dispatched(&self, count: u64) {
        self.dispatched.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_follow_ups(&self, count: u64) {
        self.follow_ups.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_batch_stored(&self, items: u64) {
        self.batches_stored.fetch_add(1, Ordering::Relaxed);
        self.items_stored.fetch_add(items, Ordering::Relaxed);
    }

    pub fn record_batch_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            follow_ups: self.follow_ups.load(Ordering::Relaxed),
            items_stored: self.items_stored.load(Ordering::Relaxed),
            batches_stored: self.batches_stored.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
        }
    }
}
