//! Worker loop
//!
//! Each worker pops one seed at a time, runs the extractor against it and
//! routes the buffered results once the extraction stream is exhausted.

use crate::config::Config;
use crate::crawler::extract::{Extractor, Yield};
use crate::state::{InFlightGuard, Item, PipelineContext, Seed};
use crate::storage::{DurableStore, StoreWrite};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

/// What happened to one popped seed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    /// Results were handed off; items go to the sinks, follow-ups to the queue
    Succeeded { items: usize, follow_ups: usize },

    /// The seed was re-queued with the given retry count
    Retried(u32),

    /// The seed ran out of retries and was acknowledged as failed
    Dropped,

    /// Stop was raised before the results could be handed off
    Interrupted,
}

/// Everything one extraction produced, held until the stream ends
#[derive(Debug, Default)]
struct Collected {
    items: Vec<Item>,
    follow_ups: Vec<Seed>,
    outcome: Option<bool>,
}

impl Collected {
    fn is_success(&self) -> bool {
        match self.outcome {
            Some(outcome) => outcome,
            None => !self.items.is_empty() || !self.follow_ups.is_empty(),
        }
    }
}

pub struct Worker {
    id: usize,
    ctx: Arc<PipelineContext>,
    store: Arc<dyn DurableStore>,
    extractor: Arc<dyn Extractor>,
    max_retries: u32,
    poll_wait: Duration,
}

impl Worker {
    pub fn new(
        id: usize,
        ctx: Arc<PipelineContext>,
        store: Arc<dyn DurableStore>,
        extractor: Arc<dyn Extractor>,
        config: &Config,
    ) -> Self {
        Self {
            id,
            ctx,
            store,
            extractor,
            max_retries: config.pipeline.max_retries,
            poll_wait: config.timing.poll_wait(),
        }
    }

    /// Processes seeds until stop is raised
    pub fn run(&self) {
        while !self.ctx.is_stopped() {
            // Held across the pop so a seed is never invisible to the monitor
            let guard = self.ctx.begin_work();
            match self.ctx.seeds().pop() {
                Some(seed) => {
                    self.attempt(seed, guard);
                }
                None => {
                    drop(guard);
                    self.ctx.stop().sleep(self.poll_wait);
                }
            }
        }
        tracing::debug!("Worker {} stopped", self.id);
    }

    /// Runs one attempt for `seed` and routes its outcome
    pub fn process_seed(&self, seed: Seed) -> Attempt {
        self.attempt(seed, self.ctx.begin_work())
    }

    // `_guard` keeps this worker counted as in flight until the outcome is routed
    fn attempt(&self, seed: Seed, _guard: InFlightGuard<'_>) -> Attempt {
        if seed.is_exhausted(self.max_retries) {
            return self.drop_seed(seed);
        }

        tracing::debug!("Worker {} processing {}", self.id, seed);

        let collected = panic::catch_unwind(AssertUnwindSafe(|| self.collect(&seed)));
        match collected {
            Ok(Ok(collected)) if collected.is_success() => self.complete(seed, collected),
            Ok(Ok(_)) => {
                tracing::debug!("Worker {}: {} yielded no success", self.id, seed.payload);
                self.retry(seed)
            }
            Ok(Err(e)) => {
                tracing::warn!("Worker {}: extraction failed for {}: {:#}", self.id, seed.payload, e);
                self.retry(seed)
            }
            Err(payload) => {
                tracing::warn!(
                    "Worker {}: extractor panicked on {}: {}",
                    self.id,
                    seed.payload,
                    panic_message(payload.as_ref())
                );
                self.retry(seed)
            }
        }
    }

    fn collect(&self, seed: &Seed) -> anyhow::Result<Collected> {
        let mut collected = Collected::default();
        for produced in self.extractor.extract(seed) {
            match produced? {
                Yield::Item(item) => {
                    if !self.ctx.has_destination(&item.destination) {
                        anyhow::bail!("item for unknown destination '{}'", item.destination);
                    }
                    collected.items.push(item);
                }
                Yield::FollowUp(next) => collected.follow_ups.push(next),
                Yield::FollowUps(next) => collected.follow_ups.extend(next),
                Yield::Outcome(outcome) => collected.outcome = Some(outcome),
            }
        }
        Ok(collected)
    }

    fn complete(&self, seed: Seed, collected: Collected) -> Attempt {
        let Collected {
            items,
            mut follow_ups,
            ..
        } = collected;

        let max_retries = self.max_retries;
        follow_ups.retain(|next| !next.is_exhausted(max_retries));
        let follow_up_count = follow_ups.len();
        if follow_up_count > 0 {
            if !self.ctx.enqueue_seeds(follow_ups) {
                return self.interrupt(seed);
            }
            self.ctx.counters().record_follow_ups(follow_up_count as u64);
        }

        let item_count = items.len();
        if item_count == 0 {
            self.ctx
                .write_or_defer(self.store.as_ref(), StoreWrite::Ack(vec![seed.clone()]));
        } else {
            // Register first so a fast storer cannot settle before we do
            let ticket = self.ctx.ledger().register(item_count);
            if self.ctx.enqueue_items(ticket, &seed, items).is_err() {
                self.ctx.ledger().abandon(ticket);
                return self.interrupt(seed);
            }
        }

        self.ctx.counters().record_success();
        tracing::debug!(
            "Worker {}: {} done with {} items and {} follow-ups",
            self.id,
            seed.payload,
            item_count,
            follow_up_count
        );
        Attempt::Succeeded {
            items: item_count,
            follow_ups: follow_up_count,
        }
    }

    fn retry(&self, mut seed: Seed) -> Attempt {
        seed.record_failure();
        if seed.is_exhausted(self.max_retries) {
            return self.drop_seed(seed);
        }

        self.ctx.counters().record_retry();
        let retry_count = seed.retry_count;
        if !self.ctx.enqueue_seed(seed.clone()) {
            return self.interrupt(seed);
        }
        Attempt::Retried(retry_count)
    }

    fn drop_seed(&self, seed: Seed) -> Attempt {
        tracing::warn!(
            "Worker {}: dropping {} after {} failed attempts",
            self.id,
            seed.payload,
            seed.retry_count
        );
        self.ctx
            .write_or_defer(self.store.as_ref(), StoreWrite::AckFailed(vec![seed]));
        self.ctx.counters().record_drop();
        Attempt::Dropped
    }

    // Stop refused the hand-off; return the seed to the durable store as is
    fn interrupt(&self, seed: Seed) -> Attempt {
        self.ctx
            .write_or_defer(self.store.as_ref(), StoreWrite::Reset(vec![seed]));
        Attempt::Interrupted
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
