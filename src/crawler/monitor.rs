//! Termination detection and liveness
//!
//! The monitor decides when the pipeline may stop using a two-stage
//! protocol: once upstream is exhausted and the workers are idle it raises
//! drain (storers flush partial batches, dispatch pauses), waits a settle
//! delay, and only raises stop if nothing moved in the meantime.

use crate::config::{Config, IdleMode};
use crate::state::PipelineContext;
use crate::storage::DurableStore;
use std::sync::Arc;
use std::time::Duration;

/// One observation of every work counter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sample {
    pub in_flight: usize,
    pub ready: u64,
    pub total: u64,
    pub queued_seeds: usize,
    pub queued_items: usize,
    /// Acknowledgments and resets waiting to be replayed against the store
    pub deferred: usize,
}

impl Sample {
    /// Nothing anywhere: no work queued, running, ready or locked
    pub fn is_idle(&self) -> bool {
        self.in_flight == 0
            && self.ready == 0
            && self.total == 0
            && self.queued_seeds == 0
            && self.queued_items == 0
            && self.deferred == 0
    }

    /// Work that only the workers or the dispatcher can make progress on
    pub fn has_new_work(&self) -> bool {
        self.queued_seeds > 0 || self.in_flight > 0 || self.ready > 0
    }
}

/// What one monitor step concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Stop was raised
    Stopped,
    /// Idle in long-running mode; keep waiting
    Idle,
    /// Work appeared during the settle delay; drain cleared
    Resumed,
    /// Only sink items, locked seeds or deferred writes remain; drain kept raised
    Flushing,
    /// Upstream still active or workers busy
    Busy,
}

pub struct TerminationMonitor {
    ctx: Arc<PipelineContext>,
    store: Arc<dyn DurableStore>,
    idle_mode: IdleMode,
    grace: Duration,
    interval: Duration,
    settle: Duration,
    idle_wait: Duration,
}

impl TerminationMonitor {
    pub fn new(ctx: Arc<PipelineContext>, store: Arc<dyn DurableStore>, config: &Config) -> Self {
        Self {
            ctx,
            store,
            idle_mode: config.pipeline.idle_mode,
            grace: config.timing.monitor_grace(),
            interval: config.timing.monitor_interval(),
            settle: config.timing.settle_delay(),
            idle_wait: config.timing.idle_wait(),
        }
    }

    /// Watches the pipeline until stop is raised
    pub fn run(&self) {
        if self.ctx.stop().sleep(self.grace) {
            return;
        }

        loop {
            let pause = match self.step() {
                Verdict::Stopped => return,
                Verdict::Idle => self.idle_wait,
                Verdict::Resumed | Verdict::Flushing | Verdict::Busy => self.interval,
            };
            if self.ctx.stop().sleep(pause) {
                return;
            }
        }
    }

    /// Runs one detection round, including the settle delay when it applies
    pub fn step(&self) -> Verdict {
        if self.ctx.is_stopped() {
            return Verdict::Stopped;
        }
        self.ctx.retry_deferred(self.store.as_ref());
        let Some(sample) = self.sample() else {
            return Verdict::Busy;
        };
        tracing::info!(
            "Status: {} in flight, {} ready, {} stored seeds, {} queued seeds, {} queued items, \
             {} deferred writes",
            sample.in_flight,
            sample.ready,
            sample.total,
            sample.queued_seeds,
            sample.queued_items,
            sample.deferred
        );

        let exhausted = self.ctx.exhausted().is_raised();
        if !(exhausted && sample.queued_seeds == 0 && sample.in_flight == 0) {
            if self.ctx.drain().clear() {
                tracing::info!("Work in progress, drain cleared");
            }
            return Verdict::Busy;
        }

        if self.ctx.drain().raise() {
            tracing::info!("Upstream exhausted and workers idle, draining");
        }
        if self.ctx.stop().sleep(self.settle) {
            return Verdict::Stopped;
        }

        self.ctx.retry_deferred(self.store.as_ref());
        let Some(settled) = self.sample() else {
            return Verdict::Busy;
        };
        if settled.is_idle() {
            return match self.idle_mode {
                IdleMode::Finite => {
                    tracing::info!("Pipeline idle after settle delay, stopping");
                    self.ctx.raise_stop();
                    Verdict::Stopped
                }
                IdleMode::LongRunning => {
                    tracing::info!(
                        "Pipeline idle, waiting {}s for new work",
                        self.idle_wait.as_secs()
                    );
                    Verdict::Idle
                }
            };
        }

        if settled.has_new_work() {
            if self.ctx.drain().clear() {
                tracing::info!("New work detected, resuming");
            }
            return Verdict::Resumed;
        }

        tracing::debug!(
            "Waiting on {} queued items, {} locked seeds and {} deferred writes",
            settled.queued_items,
            settled.total.saturating_sub(settled.ready),
            settled.deferred
        );
        Verdict::Flushing
    }

    /// Reads every counter; `None` if the store could not be reached
    pub fn sample(&self) -> Option<Sample> {
        let ready = self.store.ready_occupancy();
        let total = self.store.total_occupancy();
        match (ready, total) {
            (Ok(ready), Ok(total)) => Some(Sample {
                in_flight: self.ctx.in_flight(),
                ready,
                total,
                queued_seeds: self.ctx.seeds().len(),
                queued_items: self.ctx.sink_occupancy(),
                deferred: self.ctx.deferred_writes(),
            }),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!("Monitor failed to read store occupancy: {}", e);
                None
            }
        }
    }
}

/// Periodic liveness signal to the durable store
pub struct Heartbeat {
    ctx: Arc<PipelineContext>,
    store: Arc<dyn DurableStore>,
    interval: Duration,
}

impl Heartbeat {
    pub fn new(ctx: Arc<PipelineContext>, store: Arc<dyn DurableStore>, config: &Config) -> Self {
        Self {
            ctx,
            store,
            interval: config.timing.heartbeat_interval(),
        }
    }

    pub fn run(&self) {
        loop {
            if let Err(e) = self.store.heartbeat() {
                tracing::warn!("Heartbeat failed: {}", e);
            }
            if self.ctx.stop().sleep(self.interval) {
                return;
            }
        }
    }
}
