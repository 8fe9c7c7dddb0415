//! Upstream seed producers
//!
//! The seed scheduler extends the durable store from a [`SeedSource`] while
//! it holds the fairness lock. A pipeline without a source only processes
//! what is already in the store.

use crate::state::Seed;
use anyhow::Context;
use std::path::Path;
use std::sync::Mutex;

/// Producer of new seeds
pub trait SeedSource: Send + Sync {
    /// Returns up to `limit` new seeds
    ///
    /// `Ok(None)` means the source is exhausted and will never produce again.
    fn next_batch(&self, limit: usize) -> anyhow::Result<Option<Vec<Seed>>>;
}

/// Source backed by a finite iterator
pub struct IterSource {
    seeds: Mutex<Box<dyn Iterator<Item = Seed> + Send>>,
}

impl IterSource {
    pub fn new<I>(seeds: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Seed> + 'static,
        I::IntoIter: Send + 'static,
    {
        Self {
            seeds: Mutex::new(Box::new(seeds.into_iter().map(Into::into))),
        }
    }

    /// Reads seeds from a file, see [`read_seed_file`]
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        Ok(Self::new(read_seed_file(path)?))
    }
}

/// Reads one seed per line, skipping blank lines and `#` comments
pub fn read_seed_file(path: &Path) -> anyhow::Result<Vec<Seed>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read seed file {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(Seed::new)
        .collect())
}

impl SeedSource for IterSource {
    fn next_batch(&self, limit: usize) -> anyhow::Result<Option<Vec<Seed>>> {
        let mut seeds = self
            .seeds
            .lock()
            .map_err(|_| anyhow::anyhow!("seed source lock poisoned"))?;
        let batch: Vec<Seed> = seeds.by_ref().take(limit).collect();
        if batch.is_empty() {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }
}
