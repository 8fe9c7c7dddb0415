//! Storage module for durable seed persistence
//!
//! This module handles everything the pipeline keeps outside process memory:
//! - The `DurableStore` contract (ready/locked/failed seeds, fairness lock)
//! - A SQLite-backed store shared by every pipeline pointed at the same file
//! - An in-process store for single-process runs and tests
//! - Run tracking for `--stats`

mod memory;
mod schema;
mod sqlite;
mod traits;

pub use memory::MemorySeedStore;
pub use sqlite::SqliteSeedStore;
pub use traits::{DurableStore, StorageError, StorageResult, StoreWrite};

use crate::SluiceError;
use std::path::Path;
use std::time::Duration;

/// Opens (or creates) the SQLite seed store at `path`
pub fn open_store(path: &Path, lock_ttl: Duration) -> Result<SqliteSeedStore, SluiceError> {
    SqliteSeedStore::new(path, lock_ttl)
}

/// Lifecycle state of a durable seed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeedState {
    Ready,
    Locked,
    Failed,
}

impl SeedState {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Locked => "locked",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "ready" => Some(Self::Ready),
            "locked" => Some(Self::Locked),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Represents a pipeline run
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub config_hash: String,
    pub status: RunStatus,
}

/// Status of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}
