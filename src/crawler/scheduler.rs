//! Seed scheduling
//!
//! This module handles:
//! - Replenishing the durable store from the seed source under the fairness
//!   lock (`schedule_seed`)
//! - Dispatching ready seeds from the durable store into the in-memory seed
//!   queue with backpressure (`schedule_task`)

use crate::config::Config;
use crate::crawler::source::SeedSource;
use crate::state::{PipelineContext, Seed};
use crate::storage::{DurableStore, StoreWrite};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Result of one replenishment attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplenishTick {
    /// Seeds were pushed into the durable store
    Pushed(usize),
    /// Durable ready occupancy is above the size cap
    OverCap,
    /// Another holder has the fairness lock
    LockBusy,
    /// The source will produce no more seeds
    Exhausted,
    /// The store or the source failed; retried next tick
    Failed,
}

/// Result of one dispatch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchTick {
    /// Seeds moved into the seed queue
    Dispatched(usize),
    /// Drain is raised
    Paused,
    /// The seed queue is at its threshold
    Backpressure,
    /// Nothing ready in the durable store
    Idle,
    /// The store failed; retried next tick
    Failed,
}

/// Moves seeds from the source into the durable store and from the durable
/// store into the seed queue
pub struct Scheduler {
    id: usize,
    ctx: Arc<PipelineContext>,
    store: Arc<dyn DurableStore>,
    source: Option<Arc<dyn SeedSource>>,
    size_cap: u64,
    queue_threshold: usize,
    replenish_batch: usize,
    poll_wait: Duration,
    poll_block: Duration,
    seed_backoff: Duration,
    // Seeds taken from the source whose push to the store failed
    unpushed: Mutex<Vec<Seed>>,
}

impl Scheduler {
    pub fn new(
        id: usize,
        ctx: Arc<PipelineContext>,
        store: Arc<dyn DurableStore>,
        source: Option<Arc<dyn SeedSource>>,
        config: &Config,
    ) -> Self {
        Self {
            id,
            ctx,
            store,
            source,
            size_cap: config.pipeline.scheduler_size_cap,
            queue_threshold: config.pipeline.queue_length_threshold,
            replenish_batch: config.source.replenish_batch,
            poll_wait: config.timing.poll_wait(),
            poll_block: config.timing.poll_block(),
            seed_backoff: config.timing.seed_backoff(),
            unpushed: Mutex::new(Vec::new()),
        }
    }

    /// Replenishment loop; returns on stop or once the source is exhausted
    pub fn schedule_seed(&self) {
        let source = match &self.source {
            Some(source) => Arc::clone(source),
            None => {
                if self.ctx.exhausted().raise() {
                    tracing::info!("No seed source configured, processing stored seeds only");
                }
                return;
            }
        };

        while !self.ctx.is_stopped() {
            let pause = match self.replenish(source.as_ref()) {
                ReplenishTick::Pushed(_) => continue,
                ReplenishTick::OverCap => self.seed_backoff,
                ReplenishTick::LockBusy | ReplenishTick::Failed => self.poll_wait,
                ReplenishTick::Exhausted => {
                    if self.ctx.exhausted().raise() {
                        tracing::info!("Seed source exhausted");
                    }
                    return;
                }
            };
            self.ctx.stop().sleep(pause);
        }
        tracing::debug!("Scheduler {} seed loop stopped", self.id);
    }

    /// Dispatch loop; returns on stop
    pub fn schedule_task(&self) {
        while !self.ctx.is_stopped() {
            let pause = match self.dispatch() {
                DispatchTick::Dispatched(_) => continue,
                DispatchTick::Backpressure => self.poll_block,
                DispatchTick::Paused | DispatchTick::Idle | DispatchTick::Failed => self.poll_wait,
            };
            self.ctx.stop().sleep(pause);
        }
        tracing::debug!("Scheduler {} task loop stopped", self.id);
    }

    /// Runs one replenishment step against `source`
    pub fn replenish(&self, source: &dyn SeedSource) -> ReplenishTick {
        let ready = match self.store.ready_occupancy() {
            Ok(ready) => ready,
            Err(e) => {
                tracing::warn!("Scheduler {}: failed to read ready occupancy: {}", self.id, e);
                return ReplenishTick::Failed;
            }
        };
        if ready > self.size_cap {
            tracing::debug!(
                "Scheduler {}: {} ready seeds above cap {}, backing off",
                self.id,
                ready,
                self.size_cap
            );
            return ReplenishTick::OverCap;
        }

        match self.store.acquire_fairness_lock() {
            Ok(true) => {}
            Ok(false) => return ReplenishTick::LockBusy,
            Err(e) => {
                tracing::warn!("Scheduler {}: failed to take fairness lock: {}", self.id, e);
                return ReplenishTick::Failed;
            }
        }

        let tick = self.replenish_locked(source);

        if let Err(e) = self.store.release_fairness_lock() {
            tracing::warn!("Scheduler {}: failed to release fairness lock: {}", self.id, e);
        }
        tick
    }

    fn replenish_locked(&self, source: &dyn SeedSource) -> ReplenishTick {
        let mut unpushed = match self.unpushed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if unpushed.is_empty() {
            match source.next_batch(self.replenish_batch) {
                Ok(Some(seeds)) => *unpushed = seeds,
                Ok(None) => return ReplenishTick::Exhausted,
                Err(e) => {
                    tracing::warn!("Scheduler {}: seed source failed: {:#}", self.id, e);
                    return ReplenishTick::Failed;
                }
            }
        }

        match self.store.push(&unpushed) {
            Ok(()) => {
                let count = unpushed.len();
                unpushed.clear();
                tracing::debug!("Scheduler {}: pushed {} seeds into the store", self.id, count);
                ReplenishTick::Pushed(count)
            }
            Err(e) => {
                tracing::warn!(
                    "Scheduler {}: failed to push {} seeds, will retry: {}",
                    self.id,
                    unpushed.len(),
                    e
                );
                ReplenishTick::Failed
            }
        }
    }

    /// Runs one dispatch step
    pub fn dispatch(&self) -> DispatchTick {
        if self.ctx.drain().is_raised() {
            return DispatchTick::Paused;
        }
        if self.ctx.seeds().len() >= self.queue_threshold {
            return DispatchTick::Backpressure;
        }

        match self.store.ready_occupancy() {
            Ok(0) => return DispatchTick::Idle,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Scheduler {}: failed to read ready occupancy: {}", self.id, e);
                return DispatchTick::Failed;
            }
        }

        // Seeds between the store and the queue count as in flight
        let _guard = self.ctx.begin_work();
        let seeds = match self.store.pull_ready(self.queue_threshold) {
            Ok(seeds) => seeds,
            Err(e) => {
                tracing::warn!("Scheduler {}: failed to pull ready seeds: {}", self.id, e);
                return DispatchTick::Failed;
            }
        };
        if seeds.is_empty() {
            return DispatchTick::Idle;
        }

        let count = seeds.len();
        if !self.ctx.enqueue_seeds(seeds.clone()) {
            // Stopped between the pull and the push; hand them back
            tracing::debug!("Scheduler {}: stopped, returning {} seeds", self.id, count);
            self.ctx
                .write_or_defer(self.store.as_ref(), StoreWrite::Reset(seeds));
            return DispatchTick::Paused;
        }

        self.ctx.counters().record_dispatched(count as u64);
        tracing::debug!("Scheduler {}: dispatched {} seeds", self.id, count);
        DispatchTick::Dispatched(count)
    }
}
