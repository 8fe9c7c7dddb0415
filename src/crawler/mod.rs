//! Crawler module for moving seeds through the pipeline
//!
//! This module contains the pipeline roles, including:
//! - Seed replenishment and dispatch (`Scheduler`)
//! - Extraction with retry semantics (`Worker`)
//! - Batched persistence per destination (`Storer`)
//! - Drain/stop detection and liveness (`TerminationMonitor`, `Heartbeat`)
//! - Overall run coordination (`Coordinator`)

mod coordinator;
mod extract;
mod monitor;
mod scheduler;
mod sink;
mod source;
mod worker;

pub use coordinator::{Coordinator, RunReport};
pub use extract::{Extraction, Extractor, Passthrough, Yield};
pub use monitor::{Heartbeat, Sample, TerminationMonitor, Verdict};
pub use scheduler::{DispatchTick, ReplenishTick, Scheduler};
pub use sink::Storer;
pub use source::{read_seed_file, IterSource, SeedSource};
pub use worker::{Attempt, Worker};
