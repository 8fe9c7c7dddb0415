//! Pipeline coordinator - wires every role together and runs it
//!
//! This module contains the entry point of a pipeline run, including:
//! - Validating that every destination has a sink backend
//! - Spawning schedulers, workers, storers, the monitor and the heartbeat on
//!   named threads
//! - Joining them and returning unfinished work to the durable store
//! - Producing a run report

use crate::config::{validate, Config};
use crate::crawler::extract::Extractor;
use crate::crawler::monitor::{Heartbeat, TerminationMonitor};
use crate::crawler::scheduler::Scheduler;
use crate::crawler::sink::Storer;
use crate::crawler::source::SeedSource;
use crate::crawler::worker::Worker;
use crate::output::SinkBackend;
use crate::state::{CounterSnapshot, PipelineContext, Seed};
use crate::storage::{DurableStore, StoreWrite};
use crate::{ConfigError, SluiceError};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Summary of a finished run
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Final values of the run counters
    pub counters: CounterSnapshot,

    /// Wall-clock time from spawn to the last join
    pub elapsed: Duration,

    /// Seeds returned to the durable store because they were still buffered
    /// in memory at shutdown
    pub returned_seeds: usize,

    /// Acknowledgments and resets that still could not reach the durable
    /// store after the final replay
    pub unsettled_writes: usize,
}

/// Builds and runs one pipeline
pub struct Coordinator {
    config: Config,
    ctx: Arc<PipelineContext>,
    store: Arc<dyn DurableStore>,
    extractor: Arc<dyn Extractor>,
    source: Option<Arc<dyn SeedSource>>,
    sinks: HashMap<String, Arc<dyn SinkBackend>>,
}

impl Coordinator {
    /// Creates a coordinator with one sink queue per configured destination
    ///
    /// # Arguments
    ///
    /// * `config` - The pipeline configuration
    /// * `store` - The durable seed store shared by every role
    /// * `extractor` - The extraction callback the workers run
    pub fn new(config: Config, store: Arc<dyn DurableStore>, extractor: Arc<dyn Extractor>) -> Self {
        let ctx = Arc::new(PipelineContext::new(config.sink.destinations.iter().cloned()));
        Self {
            config,
            ctx,
            store,
            extractor,
            source: None,
            sinks: HashMap::new(),
        }
    }

    /// Sets the upstream source the schedulers extend the store from
    pub fn with_source(mut self, source: Arc<dyn SeedSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Registers the backend persisting `destination`
    pub fn with_sink(mut self, destination: impl Into<String>, backend: Arc<dyn SinkBackend>) -> Self {
        self.sinks.insert(destination.into(), backend);
        self
    }

    /// The shared context; raising stop on it ends the run
    pub fn context(&self) -> Arc<PipelineContext> {
        Arc::clone(&self.ctx)
    }

    /// Checks the configuration and the registered capabilities
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate(&self.config)?;

        for destination in &self.config.sink.destinations {
            if !self.sinks.contains_key(destination) {
                return Err(ConfigError::MissingSink(destination.clone()));
            }
        }
        for destination in self.sinks.keys() {
            if !self.ctx.has_destination(destination) {
                return Err(ConfigError::Validation(format!(
                    "sink registered for unconfigured destination '{}'",
                    destination
                )));
            }
        }
        Ok(())
    }

    /// Runs the pipeline until stop is raised
    ///
    /// # Returns
    ///
    /// * `Ok(RunReport)` - Every role exited cleanly
    /// * `Err(SluiceError)` - Startup validation failed, a thread could not be
    ///   spawned, or a role panicked
    pub fn run(self) -> Result<RunReport, SluiceError> {
        self.validate()?;

        let pipeline = &self.config.pipeline;
        tracing::info!(
            "Starting pipeline: {} workers, {} schedulers, destinations [{}]",
            pipeline.workers,
            pipeline.schedulers,
            self.ctx.destinations().join(", ")
        );

        let started = Instant::now();
        let mut handles = Vec::new();
        let spawned = self.spawn_all(&mut handles);
        if spawned.is_err() {
            self.ctx.raise_stop();
        }

        let mut panicked = Vec::new();
        for (name, handle) in handles {
            if handle.join().is_err() {
                panicked.push(name);
            }
        }
        spawned?;

        let returned_seeds = self.return_buffered_seeds();
        let unsettled_writes = self.ctx.retry_deferred(self.store.as_ref());
        if unsettled_writes > 0 {
            tracing::warn!(
                "{} store writes could not be replayed; affected seeds stay locked until recovered",
                unsettled_writes
            );
        }
        let report = RunReport {
            counters: self.ctx.counters().snapshot(),
            elapsed: started.elapsed(),
            returned_seeds,
            unsettled_writes,
        };

        if let Some(name) = panicked.into_iter().next() {
            return Err(SluiceError::ThreadPanic(name));
        }

        tracing::info!(
            "Pipeline finished in {:.1}s: {} succeeded, {} retried, {} dropped, {} items stored",
            report.elapsed.as_secs_f64(),
            report.counters.succeeded,
            report.counters.retried,
            report.counters.dropped,
            report.counters.items_stored
        );
        Ok(report)
    }

    fn spawn_all(&self, handles: &mut Vec<(String, JoinHandle<()>)>) -> Result<(), SluiceError> {
        for id in 0..self.config.pipeline.schedulers {
            let scheduler = Arc::new(Scheduler::new(
                id,
                Arc::clone(&self.ctx),
                Arc::clone(&self.store),
                self.source.clone(),
                &self.config,
            ));
            let seeder = Arc::clone(&scheduler);
            self.spawn(handles, format!("scheduler-{}-seed", id), move || {
                seeder.schedule_seed()
            })?;
            self.spawn(handles, format!("scheduler-{}-task", id), move || {
                scheduler.schedule_task()
            })?;
        }

        for id in 0..self.config.pipeline.workers {
            let worker = Worker::new(
                id,
                Arc::clone(&self.ctx),
                Arc::clone(&self.store),
                Arc::clone(&self.extractor),
                &self.config,
            );
            self.spawn(handles, format!("worker-{}", id), move || worker.run())?;
        }

        for destination in self.ctx.destinations() {
            let Some(backend) = self.sinks.get(destination) else {
                continue;
            };
            let storer = Storer::new(
                destination,
                Arc::clone(&self.ctx),
                Arc::clone(&self.store),
                Arc::clone(backend),
                &self.config,
            );
            self.spawn(handles, format!("storer-{}", destination), move || storer.run())?;
        }

        let monitor =
            TerminationMonitor::new(Arc::clone(&self.ctx), Arc::clone(&self.store), &self.config);
        self.spawn(handles, "monitor".to_string(), move || monitor.run())?;

        let heartbeat = Heartbeat::new(Arc::clone(&self.ctx), Arc::clone(&self.store), &self.config);
        self.spawn(handles, "heartbeat".to_string(), move || heartbeat.run())?;

        Ok(())
    }

    fn spawn<F>(
        &self,
        handles: &mut Vec<(String, JoinHandle<()>)>,
        name: String,
        body: F,
    ) -> Result<(), SluiceError>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = StopOnPanic {
            role: name.clone(),
            ctx: Arc::clone(&self.ctx),
        };
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _guard = guard;
                body();
            })
            .map_err(|source| SluiceError::Spawn {
                role: name.clone(),
                source,
            })?;
        handles.push((name, handle));
        Ok(())
    }

    // Seeds still in the in-memory queue are locked in the store (or were
    // never stored, for follow-ups); reset makes them ready again
    fn return_buffered_seeds(&self) -> usize {
        let leftover: Vec<Seed> = std::iter::from_fn(|| self.ctx.seeds().pop()).collect();
        if leftover.is_empty() {
            return 0;
        }
        let count = leftover.len();
        if self
            .ctx
            .write_or_defer(self.store.as_ref(), StoreWrite::Reset(leftover))
        {
            tracing::info!("Returned {} buffered seeds to the store", count);
        }
        count
    }
}

/// Raises stop if the owning thread unwinds, so one failed role ends the run
struct StopOnPanic {
    role: String,
    ctx: Arc<PipelineContext>,
}

impl Drop for StopOnPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            tracing::error!("Thread {} panicked, stopping pipeline", self.role);
            self.ctx.raise_stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::extract::{Passthrough, Yield};
    use crate::crawler::testing::test_config;
    use crate::output::OutputResult;
    use crate::state::Item;
    use crate::storage::MemorySeedStore;

    fn discard(_: &[Item]) -> OutputResult<()> {
        Ok(())
    }

    #[test]
    fn test_missing_sink_is_rejected() {
        let config = test_config(&["articles", "authors"]);
        let coordinator = Coordinator::new(
            config,
            Arc::new(MemorySeedStore::new()),
            Arc::new(Passthrough::new("articles")),
        )
        .with_sink("articles", Arc::new(discard));

        match coordinator.run() {
            Err(SluiceError::Config(ConfigError::MissingSink(dest))) => assert_eq!(dest, "authors"),
            other => panic!("expected missing sink error, got {:?}", other.map(|r| r.counters)),
        }
    }

    #[test]
    fn test_sink_for_unknown_destination_is_rejected() {
        let coordinator = Coordinator::new(
            test_config(&["articles"]),
            Arc::new(MemorySeedStore::new()),
            Arc::new(Passthrough::new("articles")),
        )
        .with_sink("articles", Arc::new(discard))
        .with_sink("authors", Arc::new(discard));

        assert!(matches!(coordinator.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        let mut config = test_config(&["articles"]);
        config.pipeline.workers = 0;
        let coordinator = Coordinator::new(
            config,
            Arc::new(MemorySeedStore::new()),
            Arc::new(Passthrough::new("articles")),
        )
        .with_sink("articles", Arc::new(discard));

        assert!(coordinator.validate().is_err());
    }

    #[test]
    fn test_run_processes_stored_seeds_and_stops() {
        let store = Arc::new(MemorySeedStore::with_seeds(["a", "b", "c"]));
        let coordinator = Coordinator::new(
            test_config(&["articles"]),
            store.clone(),
            Arc::new(|_: &Seed| -> Vec<anyhow::Result<Yield>> { vec![Ok(Yield::Outcome(true))] }),
        )
        .with_sink("articles", Arc::new(discard));

        let report = coordinator.run().unwrap();
        assert_eq!(report.counters.succeeded, 3);
        assert_eq!(store.total_acks(), 3);
        assert_eq!(store.total_occupancy().unwrap(), 0);
    }

    #[test]
    fn test_external_stop_before_run() {
        let store = Arc::new(MemorySeedStore::with_seeds(["a"]));
        let coordinator = Coordinator::new(
            test_config(&["articles"]),
            store.clone(),
            Arc::new(Passthrough::new("articles")),
        )
        .with_sink("articles", Arc::new(discard));

        coordinator.context().raise_stop();
        let report = coordinator.run().unwrap();
        assert_eq!(report.counters.dispatched, 0);
        assert_eq!(store.ready_occupancy().unwrap(), 1);
    }
}
