//! Storage traits and error types
//!
//! This module defines the durable seed store contract consumed by the
//! scheduler, the workers, and the sinks.

use crate::state::Seed;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Run not found: {0}")]
    RunNotFound(i64),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Durable, multi-consumer seed storage
///
/// Seeds live in one of three states: *ready* (waiting to be pulled),
/// *locked* (pulled by some pipeline and not yet acknowledged or reset),
/// and *failed* (dropped after exhausting retries). Implementations must be
/// safe to share between threads; every method takes `&self`.
pub trait DurableStore: Send + Sync {
    /// Number of ready seeds
    fn ready_occupancy(&self) -> StorageResult<u64>;

    /// Number of ready plus locked seeds
    fn total_occupancy(&self) -> StorageResult<u64>;

    /// Tries to take the fleet-wide replenishment lock
    ///
    /// Only one holder at a time may extend the seed set. Returns false while
    /// someone else holds it.
    fn acquire_fairness_lock(&self) -> StorageResult<bool>;

    /// Releases the replenishment lock if this store holds it
    fn release_fairness_lock(&self) -> StorageResult<()>;

    /// Moves up to `limit` ready seeds to locked and returns them, oldest first
    fn pull_ready(&self, limit: usize) -> StorageResult<Vec<Seed>>;

    /// Inserts seeds as ready; seeds already known to the store are ignored
    fn push(&self, seeds: &[Seed]) -> StorageResult<()>;

    /// Deletes seeds that completed successfully
    fn ack_delete(&self, seeds: &[Seed]) -> StorageResult<()>;

    /// Records seeds dropped after exhausting their retries
    fn ack_failed(&self, seeds: &[Seed]) -> StorageResult<()> {
        self.ack_delete(seeds)
    }

    /// Returns locked seeds to the ready pool, keeping the higher retry count
    fn reset(&self, seeds: &[Seed]) -> StorageResult<()>;

    /// Liveness signal, called on a fixed interval
    fn heartbeat(&self) -> StorageResult<()>;

    /// Returns every locked seed to ready; used at startup after a crash
    ///
    /// Returns the number of recovered seeds.
    fn recover_locked(&self) -> StorageResult<u64>;
}

/// A seed write that can be replayed after a transient store failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreWrite {
    /// `ack_delete`
    Ack(Vec<Seed>),
    /// `ack_failed`
    AckFailed(Vec<Seed>),
    /// `reset`
    Reset(Vec<Seed>),
}

impl StoreWrite {
    /// Performs the write against `store`
    pub fn apply(&self, store: &dyn DurableStore) -> StorageResult<()> {
        match self {
            Self::Ack(seeds) => store.ack_delete(seeds),
            Self::AckFailed(seeds) => store.ack_failed(seeds),
            Self::Reset(seeds) => store.reset(seeds),
        }
    }

    pub fn seeds(&self) -> &[Seed] {
        match self {
            Self::Ack(seeds) | Self::AckFailed(seeds) | Self::Reset(seeds) => seeds,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ack(_) => "acknowledge",
            Self::AckFailed(_) => "record drop of",
            Self::Reset(_) => "reset",
        }
    }
}
