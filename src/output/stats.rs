//! Statistics from the seed store
//!
//! Backs the `--stats` flag: summarizes the durable seed states and the most
//! recent run without starting a pipeline.

use crate::state::Seed;
use crate::storage::{RunRecord, SeedState, SqliteSeedStore};
use crate::SluiceError;
use std::collections::HashMap;

/// Seed store summary
#[derive(Debug, Clone)]
pub struct PipelineStatistics {
    /// Seeds per durable state
    pub seeds_by_state: HashMap<SeedState, u64>,

    /// Seeds dropped after exhausting their retries
    pub failed_seeds: Vec<Seed>,

    /// Most recent run, if any
    pub latest_run: Option<RunRecord>,
}

impl PipelineStatistics {
    /// Ready plus locked plus failed
    pub fn total_seeds(&self) -> u64 {
        self.seeds_by_state.values().sum()
    }

    pub fn count(&self, state: SeedState) -> u64 {
        self.seeds_by_state.get(&state).copied().unwrap_or(0)
    }
}

/// Loads statistics from the seed store
///
/// # Arguments
///
/// * `store` - The SQLite seed store to query
///
/// # Returns
///
/// * `Ok(PipelineStatistics)` - Successfully loaded statistics
/// * `Err(SluiceError)` - Failed to query statistics
pub fn load_statistics(store: &SqliteSeedStore) -> Result<PipelineStatistics, SluiceError> {
    let mut seeds_by_state = HashMap::new();
    for state in [SeedState::Ready, SeedState::Locked, SeedState::Failed] {
        let count = store.count_by_state(state)?;
        if count > 0 {
            seeds_by_state.insert(state, count);
        }
    }

    Ok(PipelineStatistics {
        seeds_by_state,
        failed_seeds: store.failed_seeds()?,
        latest_run: store.get_latest_run()?,
    })
}

/// Prints statistics to stdout in a formatted manner
pub fn print_statistics(stats: &PipelineStatistics) {
    println!("=== Pipeline Statistics ===\n");

    if let Some(run) = &stats.latest_run {
        println!("Latest Run:");
        println!("  Id: {}", run.id);
        println!("  Status: {}", run.status.to_db_string());
        println!("  Started: {}", run.started_at);
        if let Some(finished) = &run.finished_at {
            println!("  Finished: {}", finished);
        }
        println!();
    }

    let total = stats.total_seeds();
    println!("Seeds by State:");
    for state in [SeedState::Ready, SeedState::Locked, SeedState::Failed] {
        let count = stats.count(state);
        let percentage = if total > 0 {
            (count as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        println!("  {}: {} ({:.1}%)", state.to_db_string(), count, percentage);
    }
    println!();

    if !stats.failed_seeds.is_empty() {
        println!("Failed Seeds ({}):", stats.failed_seeds.len());
        for seed in &stats.failed_seeds {
            println!("  - {}", seed);
        }
        println!();
    }
}
