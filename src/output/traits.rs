//! Sink backend trait and error types
//!
//! This module defines the persistence contract the storers hand their
//! batches to.

use crate::state::Item;
use thiserror::Error;

/// Errors that can occur during output operations
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Failed to write output: {0}")]
    Write(String),

    #[error("Failed to serialize item: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Sink lock poisoned")]
    Poisoned,
}

/// Result type for output operations
pub type OutputResult<T> = Result<T, OutputError>;

/// Batch persistence for extracted items
///
/// `store` must persist the whole batch or nothing: on `Err` the storer
/// resets every seed of the batch and the same items will be offered again
/// later, so implementations should tolerate seeing a batch twice.
pub trait SinkBackend: Send + Sync {
    fn store(&self, items: &[Item]) -> OutputResult<()>;
}

impl<F> SinkBackend for F
where
    F: Fn(&[Item]) -> OutputResult<()> + Send + Sync,
{
    fn store(&self, items: &[Item]) -> OutputResult<()> {
        self(items)
    }
}
