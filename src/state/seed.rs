/// Seed and item definitions
///
/// A seed is one unit of extraction work; an item is one record extracted
/// from it, tagged with the destination that will persist it.
use serde::{Deserialize, Serialize};
use std::fmt;

/// A unit of crawl work
///
/// Identity is defined by the payload alone: two seeds with the same payload
/// are the same seed regardless of their retry counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Seed {
    /// Opaque task payload
    pub payload: String,

    /// Number of failed attempts so far
    #[serde(default)]
    pub retry_count: u32,
}

impl Seed {
    /// Creates a fresh seed with no failed attempts
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            retry_count: 0,
        }
    }

    /// Records one more failed attempt
    pub fn record_failure(&mut self) {
        self.retry_count = self.retry_count.saturating_add(1);
    }

    /// Returns true once this seed may no longer be attempted
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }
}

impl PartialEq for Seed {
    fn eq(&self, other: &Self) -> bool {
        self.payload == other.payload
    }
}

impl Eq for Seed {}

impl std::hash::Hash for Seed {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.payload.hash(state);
    }
}

impl From<String> for Seed {
    fn from(payload: String) -> Self {
        Self::new(payload)
    }
}

impl From<&str> for Seed {
    fn from(payload: &str) -> Self {
        Self::new(payload)
    }
}

impl fmt::Display for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (retries: {})", self.payload, self.retry_count)
    }
}

/// A successfully extracted record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Logical table or sink name
    pub destination: String,

    /// The extracted record
    pub record: serde_json::Value,
}

impl Item {
    pub fn new(destination: impl Into<String>, record: serde_json::Value) -> Self {
        Self {
            destination: destination.into(),
            record,
        }
    }
}
