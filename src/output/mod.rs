//! Output module for persisting extracted items
//!
//! This module handles:
//! - The `SinkBackend` contract the storers write batches through
//! - A transactional SQLite item sink
//! - An append-only JSON-lines sink
//! - Seed store statistics for `--stats`

mod jsonl;
mod sqlite_output;
pub mod stats;
mod traits;

pub use jsonl::JsonLinesSink;
pub use sqlite_output::SqliteSink;
pub use stats::{load_statistics, print_statistics, PipelineStatistics};
pub use traits::{OutputError, OutputResult, SinkBackend};
