//! In-process seed store
//!
//! Same contract as the SQLite store without persistence. Also keeps
//! per-seed acknowledgment and reset tallies, and can be switched into an
//! "unavailable" mode where every call fails, which lets the pipeline's
//! transient-error handling be exercised.

use crate::state::Seed;
use crate::storage::traits::{DurableStore, StorageError, StorageResult};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    ready: VecDeque<Seed>,
    locked: HashMap<String, Seed>,
    failed: HashMap<String, Seed>,
    known: HashSet<String>,
    lock_held: bool,
    acks: HashMap<String, u32>,
    resets: HashMap<String, u32>,
    heartbeats: u64,
}

/// Durable store kept entirely in process memory
#[derive(Default)]
pub struct MemorySeedStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemorySeedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store whose ready pool already holds `seeds`
    pub fn with_seeds<I, S>(seeds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Seed>,
    {
        let store = Self::new();
        let seeds: Vec<Seed> = seeds.into_iter().map(Into::into).collect();
        {
            let mut inner = store.lock_inner();
            for seed in seeds {
                if inner.known.insert(seed.payload.clone()) {
                    inner.ready.push_back(seed);
                }
            }
        }
        store
    }

    /// Makes every subsequent call fail until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of times `payload` was acknowledged as done
    pub fn ack_count(&self, payload: &str) -> u32 {
        self.lock_inner().acks.get(payload).copied().unwrap_or(0)
    }

    /// Total successful acknowledgments across all seeds
    pub fn total_acks(&self) -> u32 {
        self.lock_inner().acks.values().sum()
    }

    /// Number of times `payload` was reset to ready
    pub fn reset_count(&self, payload: &str) -> u32 {
        self.lock_inner().resets.get(payload).copied().unwrap_or(0)
    }

    /// Seeds dropped after exhausting their retries
    pub fn failed_seeds(&self) -> Vec<Seed> {
        let mut failed: Vec<Seed> = self.lock_inner().failed.values().cloned().collect();
        failed.sort_by(|a, b| a.payload.cmp(&b.payload));
        failed
    }

    pub fn heartbeats(&self) -> u64 {
        self.lock_inner().heartbeats
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn inner(&self) -> StorageResult<MutexGuard<'_, Inner>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Database("store unavailable".to_string()));
        }
        self.inner.lock().map_err(|_| StorageError::Poisoned)
    }
}

impl DurableStore for MemorySeedStore {
    fn ready_occupancy(&self) -> StorageResult<u64> {
        Ok(self.inner()?.ready.len() as u64)
    }

    fn total_occupancy(&self) -> StorageResult<u64> {
        let inner = self.inner()?;
        Ok((inner.ready.len() + inner.locked.len()) as u64)
    }

    fn acquire_fairness_lock(&self) -> StorageResult<bool> {
        let mut inner = self.inner()?;
        if inner.lock_held {
            return Ok(false);
        }
        inner.lock_held = true;
        Ok(true)
    }

    fn release_fairness_lock(&self) -> StorageResult<()> {
        self.inner()?.lock_held = false;
        Ok(())
    }

    fn pull_ready(&self, limit: usize) -> StorageResult<Vec<Seed>> {
        let mut inner = self.inner()?;
        let take = limit.min(inner.ready.len());
        let pulled: Vec<Seed> = inner.ready.drain(..take).collect();
        for seed in &pulled {
            inner.locked.insert(seed.payload.clone(), seed.clone());
        }
        Ok(pulled)
    }

    fn push(&self, seeds: &[Seed]) -> StorageResult<()> {
        let mut inner = self.inner()?;
        for seed in seeds {
            if inner.known.insert(seed.payload.clone()) {
                inner.ready.push_back(seed.clone());
            }
        }
        Ok(())
    }

    fn ack_delete(&self, seeds: &[Seed]) -> StorageResult<()> {
        let mut inner = self.inner()?;
        for seed in seeds {
            inner.locked.remove(&seed.payload);
            inner.ready.retain(|s| s.payload != seed.payload);
            inner.known.remove(&seed.payload);
            *inner.acks.entry(seed.payload.clone()).or_insert(0) += 1;
        }
        Ok(())
    }

    fn ack_failed(&self, seeds: &[Seed]) -> StorageResult<()> {
        let mut inner = self.inner()?;
        for seed in seeds {
            inner.locked.remove(&seed.payload);
            inner.ready.retain(|s| s.payload != seed.payload);
            inner.known.insert(seed.payload.clone());
            let entry = inner
                .failed
                .entry(seed.payload.clone())
                .or_insert_with(|| seed.clone());
            entry.retry_count = entry.retry_count.max(seed.retry_count);
        }
        Ok(())
    }

    fn reset(&self, seeds: &[Seed]) -> StorageResult<()> {
        let mut inner = self.inner()?;
        for seed in seeds {
            *inner.resets.entry(seed.payload.clone()).or_insert(0) += 1;
            match inner.locked.remove(&seed.payload) {
                Some(mut locked) => {
                    locked.retry_count = locked.retry_count.max(seed.retry_count);
                    inner.ready.push_back(locked);
                }
                None => {
                    if inner.known.insert(seed.payload.clone()) {
                        inner.ready.push_back(seed.clone());
                    }
                }
            }
        }
        Ok(())
    }

    fn heartbeat(&self) -> StorageResult<()> {
        self.inner()?.heartbeats += 1;
        Ok(())
    }

    fn recover_locked(&self) -> StorageResult<u64> {
        let mut inner = self.inner()?;
        let recovered: Vec<Seed> = inner.locked.drain().map(|(_, seed)| seed).collect();
        let count = recovered.len() as u64;
        inner.ready.extend(recovered);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_seeds_deduplicates() {
        let store = MemorySeedStore::with_seeds(["a", "b", "a"]);
        assert_eq!(store.ready_occupancy().unwrap(), 2);
    }

    #[test]
    fn test_pull_ack_reset_cycle() {
        let store = MemorySeedStore::with_seeds(["a", "b"]);

        let pulled = store.pull_ready(10).unwrap();
        assert_eq!(pulled.len(), 2);
        assert_eq!(store.ready_occupancy().unwrap(), 0);
        assert_eq!(store.total_occupancy().unwrap(), 2);

        store.ack_delete(&pulled[..1]).unwrap();
        let mut retry = pulled[1].clone();
        retry.record_failure();
        store.reset(&[retry]).unwrap();

        assert_eq!(store.ack_count("a"), 1);
        assert_eq!(store.reset_count("b"), 1);
        let again = store.pull_ready(10).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].retry_count, 1);
    }

    #[test]
    fn test_push_ignores_locked_and_failed_payloads() {
        let store = MemorySeedStore::with_seeds(["a", "b"]);
        let pulled = store.pull_ready(1).unwrap();
        store.ack_failed(&[Seed::new("b")]).unwrap();

        store.push(&[Seed::new("a"), Seed::new("b"), Seed::new("c")]).unwrap();

        assert_eq!(pulled[0].payload, "a");
        assert_eq!(store.ready_occupancy().unwrap(), 1);
        assert_eq!(store.failed_seeds().len(), 1);
    }

    #[test]
    fn test_fairness_lock_is_exclusive() {
        let store = MemorySeedStore::new();
        assert!(store.acquire_fairness_lock().unwrap());
        assert!(!store.acquire_fairness_lock().unwrap());
        store.release_fairness_lock().unwrap();
        assert!(store.acquire_fairness_lock().unwrap());
    }

    #[test]
    fn test_unavailable_store_fails_every_call() {
        let store = MemorySeedStore::with_seeds(["a"]);
        store.set_unavailable(true);
        assert!(store.ready_occupancy().is_err());
        assert!(store.pull_ready(1).is_err());

        store.set_unavailable(false);
        assert_eq!(store.ready_occupancy().unwrap(), 1);
    }

    #[test]
    fn test_recover_locked() {
        let store = MemorySeedStore::with_seeds(["a", "b"]);
        store.pull_ready(2).unwrap();
        assert_eq!(store.recover_locked().unwrap(), 2);
        assert_eq!(store.ready_occupancy().unwrap(), 2);
    }
}
