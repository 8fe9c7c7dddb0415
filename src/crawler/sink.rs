//! Per-destination batching storer
//!
//! A storer drains one destination's item queue into its [`SinkBackend`] in
//! batches, then acknowledges (or resets) the seeds those items came from.

use crate::config::Config;
use crate::output::SinkBackend;
use crate::state::{BoundedQueue, Handoff, Item, PipelineContext, Seed};
use crate::storage::{DurableStore, StoreWrite};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

pub struct Storer {
    destination: String,
    ctx: Arc<PipelineContext>,
    store: Arc<dyn DurableStore>,
    backend: Arc<dyn SinkBackend>,
    batch_length: usize,
    backoff: Duration,
}

impl Storer {
    pub fn new(
        destination: impl Into<String>,
        ctx: Arc<PipelineContext>,
        store: Arc<dyn DurableStore>,
        backend: Arc<dyn SinkBackend>,
        config: &Config,
    ) -> Self {
        Self {
            destination: destination.into(),
            ctx,
            store,
            backend,
            batch_length: config.pipeline.sink_batch_length,
            backoff: config.timing.sink_backoff(),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Stores batches until stop, then flushes what is left once
    pub fn run(&self) {
        while !self.ctx.is_stopped() {
            if self.flush_once() == 0 {
                self.ctx.stop().sleep(self.backoff);
            }
        }

        let remaining = self.flush_remaining();
        tracing::debug!(
            "Storer {} stopped after final flush of {} items",
            self.destination,
            remaining
        );
    }

    /// Stores one batch if it is due; returns the number of items popped
    ///
    /// A batch is due when the queue holds a full batch or drain is raised.
    pub fn flush_once(&self) -> usize {
        let Some(queue) = self.queue() else {
            return 0;
        };
        if !self.ctx.drain().is_raised() && queue.len() < self.batch_length {
            return 0;
        }

        let batch = queue.pop_up_to(self.batch_length);
        let popped = batch.len();
        if popped > 0 {
            self.write_batch(batch);
        }
        popped
    }

    /// Stores everything still queued, one batch at a time
    pub fn flush_remaining(&self) -> usize {
        let Some(queue) = self.queue() else {
            return 0;
        };

        let mut total = 0;
        loop {
            let batch = queue.pop_up_to(self.batch_length);
            if batch.is_empty() {
                return total;
            }
            total += batch.len();
            self.write_batch(batch);
        }
    }

    fn queue(&self) -> Option<&BoundedQueue<Handoff>> {
        self.ctx.sink_queue(&self.destination)
    }

    fn write_batch(&self, batch: Vec<Handoff>) {
        let items: Vec<Item> = batch.iter().map(|handoff| handoff.item.clone()).collect();
        let ledger = self.ctx.ledger();

        match self.backend.store(&items) {
            Ok(()) => {
                self.ctx.counters().record_batch_stored(items.len() as u64);
                let completed: Vec<Seed> = batch
                    .into_iter()
                    .filter(|handoff| ledger.settle(handoff.ticket))
                    .map(|handoff| handoff.seed)
                    .collect();
                tracing::debug!(
                    "Storer {}: stored {} items, {} seeds complete",
                    self.destination,
                    items.len(),
                    completed.len()
                );
                if !completed.is_empty() {
                    self.ctx
                        .write_or_defer(self.store.as_ref(), StoreWrite::Ack(completed));
                }
            }
            Err(e) => {
                self.ctx.counters().record_batch_failed();
                let mut seen = HashSet::new();
                let affected: Vec<Seed> = batch
                    .into_iter()
                    .filter(|handoff| seen.insert(handoff.ticket))
                    .filter(|handoff| ledger.abandon(handoff.ticket))
                    .map(|handoff| handoff.seed)
                    .collect();
                tracing::warn!(
                    "Storer {}: batch of {} items failed, resetting {} seeds: {}",
                    self.destination,
                    items.len(),
                    affected.len(),
                    e
                );
                if !affected.is_empty() {
                    self.ctx
                        .write_or_defer(self.store.as_ref(), StoreWrite::Reset(affected));
                }
            }
        }
    }
}
