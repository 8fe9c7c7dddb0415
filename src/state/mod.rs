//! State module for the pipeline's shared, in-memory state
//!
//! # Components
//!
//! - `Seed` / `Item`: the work unit and the extracted record
//! - `BoundedQueue`: thread-safe FIFO used for seeds and pending items
//! - `StopSignal` / `Flag`: the stop, drain, and exhausted signals
//! - `PipelineContext`: queues, signals, and counters shared by every component

mod context;
mod queue;
mod seed;
mod signal;

// Re-export main types
pub use context::{
    AckLedger, CounterSnapshot, Handoff, InFlightGuard, PipelineContext, PipelineCounters, Ticket,
};
pub use queue::BoundedQueue;
pub use seed::{Item, Seed};
pub use signal::{Flag, StopSignal};
