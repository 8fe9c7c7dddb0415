//! Sumi-Sluice: a crawl-task orchestration pipeline
//!
//! This crate moves seeds from a durable store through bounded in-memory
//! queues into a pool of worker threads, routes extracted items to batching
//! sinks, and decides when the whole pipeline may safely stop.

pub mod config;
pub mod crawler;
pub mod output;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Main error type for Sumi-Sluice operations
#[derive(Debug, Error)]
pub enum SluiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    StorageError(#[from] storage::StorageError),

    #[error("Output error: {0}")]
    Output(#[from] output::OutputError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to spawn {role} thread: {source}")]
    Spawn {
        role: String,
        source: std::io::Error,
    },

    #[error("Pipeline thread {0} panicked")]
    ThreadPanic(String),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No sink backend registered for destination '{0}'")]
    MissingSink(String),
}

/// Result type alias for Sumi-Sluice operations
pub type Result<T> = std::result::Result<T, SluiceError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{Coordinator, Extractor, RunReport, SeedSource, Yield};
pub use output::SinkBackend;
pub use state::{BoundedQueue, Item, PipelineContext, Seed};
pub use storage::DurableStore;
