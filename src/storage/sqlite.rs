//! SQLite seed store implementation
//!
//! Several pipelines (processes) may open the same database file; the
//! `locks` table then provides the fleet-wide replenishment lock.

use crate::state::Seed;
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{DurableStore, StorageError, StorageResult};
use crate::storage::{RunRecord, RunStatus, SeedState};
use crate::SluiceError;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Name of the lease guarding seed replenishment
const REPLENISH_LOCK: &str = "seed-replenish";

static INSTANCE_SEQ: AtomicU64 = AtomicU64::new(0);

/// SQLite durable seed store
pub struct SqliteSeedStore {
    conn: Mutex<Connection>,
    holder: String,
    lock_ttl: Duration,
}

impl SqliteSeedStore {
    /// Opens or creates the seed database at `path`
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    /// * `lock_ttl` - How long an acquired replenishment lock stays valid
    pub fn new(path: &Path, lock_ttl: Duration) -> Result<Self, SluiceError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self::from_connection(conn, lock_ttl))
    }

    /// Creates an in-memory database
    pub fn new_in_memory(lock_ttl: Duration) -> Result<Self, SluiceError> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self::from_connection(conn, lock_ttl))
    }

    fn from_connection(conn: Connection, lock_ttl: Duration) -> Self {
        let holder = format!(
            "pid{}-{}",
            std::process::id(),
            INSTANCE_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        Self {
            conn: Mutex::new(conn),
            holder,
            lock_ttl,
        }
    }

    /// Identifier this store uses as lock holder and heartbeat key
    pub fn holder(&self) -> &str {
        &self.holder
    }

    fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    // ===== Run Management =====

    /// Records the start of a pipeline run
    pub fn begin_run(&self, config_hash: &str) -> StorageResult<i64> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO runs (started_at, config_hash, status) VALUES (?1, ?2, ?3)",
            params![now, config_hash, RunStatus::Running.to_db_string()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Marks a run finished with the given status
    pub fn finish_run(&self, run_id: i64, status: RunStatus) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        let updated = self.conn()?.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2 WHERE id = ?3",
            params![status.to_db_string(), now, run_id],
        )?;
        if updated == 0 {
            return Err(StorageError::RunNotFound(run_id));
        }
        Ok(())
    }

    /// Gets the most recent run
    pub fn get_latest_run(&self) -> StorageResult<Option<RunRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, started_at, finished_at, config_hash, status FROM runs ORDER BY id DESC LIMIT 1",
        )?;

        let run = stmt
            .query_row([], |row| {
                Ok(RunRecord {
                    id: row.get(0)?,
                    started_at: row.get(1)?,
                    finished_at: row.get(2)?,
                    config_hash: row.get(3)?,
                    status: RunStatus::from_db_string(&row.get::<_, String>(4)?)
                        .unwrap_or(RunStatus::Interrupted),
                })
            })
            .optional()?;

        Ok(run)
    }

    // ===== Inspection =====

    /// Counts seeds in one state
    pub fn count_by_state(&self, state: SeedState) -> StorageResult<u64> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM seeds WHERE state = ?1",
            params![state.to_db_string()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Lists seeds dropped after exhausting their retries
    pub fn failed_seeds(&self) -> StorageResult<Vec<Seed>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT payload, retry_count FROM seeds WHERE state = ?1 ORDER BY seq")?;
        let seeds = stmt
            .query_map(params![SeedState::Failed.to_db_string()], |row| {
                Ok(Seed {
                    payload: row.get(0)?,
                    retry_count: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(seeds)
    }

    /// Deletes every seed and lock; used by `--fresh`
    pub fn clear(&self) -> StorageResult<()> {
        self.conn()?
            .execute_batch("DELETE FROM seeds; DELETE FROM locks;")?;
        Ok(())
    }
}

impl DurableStore for SqliteSeedStore {
    fn ready_occupancy(&self) -> StorageResult<u64> {
        self.count_by_state(SeedState::Ready)
    }

    fn total_occupancy(&self) -> StorageResult<u64> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM seeds WHERE state IN (?1, ?2)",
            params![
                SeedState::Ready.to_db_string(),
                SeedState::Locked.to_db_string()
            ],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn acquire_fairness_lock(&self) -> StorageResult<bool> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now + self.lock_ttl.as_millis() as i64;
        let changed = self.conn()?.execute(
            "INSERT INTO locks (name, holder, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at
             WHERE locks.holder = excluded.holder OR locks.expires_at <= ?4",
            params![REPLENISH_LOCK, self.holder, expires_at, now],
        )?;
        Ok(changed > 0)
    }

    fn release_fairness_lock(&self) -> StorageResult<()> {
        self.conn()?.execute(
            "DELETE FROM locks WHERE name = ?1 AND holder = ?2",
            params![REPLENISH_LOCK, self.holder],
        )?;
        Ok(())
    }

    fn pull_ready(&self, limit: usize) -> StorageResult<Vec<Seed>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now().to_rfc3339();

        let seeds = {
            let mut stmt = tx.prepare(
                "SELECT payload, retry_count FROM seeds WHERE state = ?1 ORDER BY seq LIMIT ?2",
            )?;
            let rows = stmt.query_map(
                params![SeedState::Ready.to_db_string(), limit as i64],
                |row| {
                    Ok(Seed {
                        payload: row.get(0)?,
                        retry_count: row.get(1)?,
                    })
                },
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        {
            let mut lock = tx.prepare(
                "UPDATE seeds SET state = ?1, locked_at = ?2, updated_at = ?2 WHERE payload = ?3",
            )?;
            for seed in &seeds {
                lock.execute(params![SeedState::Locked.to_db_string(), now, seed.payload])?;
            }
        }

        tx.commit()?;
        Ok(seeds)
    }

    fn push(&self, seeds: &[Seed]) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now().to_rfc3339();
        {
            let mut insert = tx.prepare(
                "INSERT OR IGNORE INTO seeds (payload, retry_count, state, updated_at) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for seed in seeds {
                insert.execute(params![
                    seed.payload,
                    seed.retry_count,
                    SeedState::Ready.to_db_string(),
                    now
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn ack_delete(&self, seeds: &[Seed]) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut delete = tx.prepare("DELETE FROM seeds WHERE payload = ?1")?;
            for seed in seeds {
                delete.execute(params![seed.payload])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn ack_failed(&self, seeds: &[Seed]) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now().to_rfc3339();
        {
            // Follow-up seeds never reached the store; record them too
            let mut fail = tx.prepare(
                "INSERT INTO seeds (payload, retry_count, state, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(payload) DO UPDATE SET
                    state = excluded.state,
                    retry_count = MAX(seeds.retry_count, excluded.retry_count),
                    locked_at = NULL,
                    updated_at = excluded.updated_at",
            )?;
            for seed in seeds {
                fail.execute(params![
                    seed.payload,
                    seed.retry_count,
                    SeedState::Failed.to_db_string(),
                    now
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn reset(&self, seeds: &[Seed]) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now().to_rfc3339();
        {
            // Seeds unknown to the store become durable here so the retry
            // survives a restart
            let mut reset = tx.prepare(
                "INSERT INTO seeds (payload, retry_count, state, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(payload) DO UPDATE SET
                    state = excluded.state,
                    retry_count = MAX(seeds.retry_count, excluded.retry_count),
                    locked_at = NULL,
                    updated_at = excluded.updated_at
                 WHERE seeds.state = ?5",
            )?;
            for seed in seeds {
                reset.execute(params![
                    seed.payload,
                    seed.retry_count,
                    SeedState::Ready.to_db_string(),
                    now,
                    SeedState::Locked.to_db_string()
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn heartbeat(&self) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        self.conn()?.execute(
            "INSERT OR REPLACE INTO heartbeats (holder, beat_at) VALUES (?1, ?2)",
            params![self.holder, now],
        )?;
        Ok(())
    }

    fn recover_locked(&self) -> StorageResult<u64> {
        let now = Utc::now().to_rfc3339();
        let recovered = self.conn()?.execute(
            "UPDATE seeds SET state = ?1, locked_at = NULL, updated_at = ?2 WHERE state = ?3",
            params![
                SeedState::Ready.to_db_string(),
                now,
                SeedState::Locked.to_db_string()
            ],
        )?;
        Ok(recovered as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> SqliteSeedStore {
        SqliteSeedStore::new_in_memory(Duration::from_secs(30)).unwrap()
    }

    fn seeds(payloads: &[&str]) -> Vec<Seed> {
        payloads.iter().map(|p| Seed::new(*p)).collect()
    }

    #[test]
    fn test_push_and_occupancy() {
        let store = store();
        store.push(&seeds(&["a", "b", "c"])).unwrap();

        assert_eq!(store.ready_occupancy().unwrap(), 3);
        assert_eq!(store.total_occupancy().unwrap(), 3);
    }

    #[test]
    fn test_push_ignores_known_payloads() {
        let store = store();
        store.push(&seeds(&["a"])).unwrap();
        store.push(&seeds(&["a", "b"])).unwrap();

        assert_eq!(store.ready_occupancy().unwrap(), 2);
    }

    #[test]
    fn test_pull_ready_locks_in_insertion_order() {
        let store = store();
        store.push(&seeds(&["a", "b", "c"])).unwrap();

        let pulled = store.pull_ready(2).unwrap();
        let payloads: Vec<_> = pulled.iter().map(|s| s.payload.as_str()).collect();
        assert_eq!(payloads, vec!["a", "b"]);

        assert_eq!(store.ready_occupancy().unwrap(), 1);
        assert_eq!(store.total_occupancy().unwrap(), 3);
        assert_eq!(store.count_by_state(SeedState::Locked).unwrap(), 2);
    }

    #[test]
    fn test_ack_delete_removes_seed() {
        let store = store();
        store.push(&seeds(&["a", "b"])).unwrap();
        let pulled = store.pull_ready(1).unwrap();

        store.ack_delete(&pulled).unwrap();

        assert_eq!(store.total_occupancy().unwrap(), 1);
    }

    #[test]
    fn test_reset_returns_locked_seed_with_higher_retry_count() {
        let store = store();
        store.push(&seeds(&["a"])).unwrap();
        let mut pulled = store.pull_ready(1).unwrap();
        pulled[0].record_failure();

        store.reset(&pulled).unwrap();

        let again = store.pull_ready(1).unwrap();
        assert_eq!(again[0].payload, "a");
        assert_eq!(again[0].retry_count, 1);
    }

    #[test]
    fn test_reset_of_unknown_seed_makes_it_durable() {
        let store = store();
        store.reset(&seeds(&["follow-up"])).unwrap();
        assert_eq!(store.ready_occupancy().unwrap(), 1);
    }

    #[test]
    fn test_reset_leaves_ready_seed_alone() {
        let store = store();
        store.push(&seeds(&["a"])).unwrap();
        let mut bumped = seeds(&["a"]);
        bumped[0].retry_count = 7;

        store.reset(&bumped).unwrap();

        let pulled = store.pull_ready(1).unwrap();
        assert_eq!(pulled[0].retry_count, 0);
    }

    #[test]
    fn test_ack_failed_moves_seed_out_of_occupancy() {
        let store = store();
        store.push(&seeds(&["a", "b"])).unwrap();
        let mut pulled = store.pull_ready(1).unwrap();
        pulled[0].retry_count = 3;

        store.ack_failed(&pulled).unwrap();

        assert_eq!(store.total_occupancy().unwrap(), 1);
        let failed = store.failed_seeds().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].payload, "a");
        assert_eq!(failed[0].retry_count, 3);
    }

    #[test]
    fn test_fairness_lock_is_exclusive_across_stores() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seeds.db");
        let first = SqliteSeedStore::new(&path, Duration::from_secs(30)).unwrap();
        let second = SqliteSeedStore::new(&path, Duration::from_secs(30)).unwrap();

        assert!(first.acquire_fairness_lock().unwrap());
        assert!(first.acquire_fairness_lock().unwrap());
        assert!(!second.acquire_fairness_lock().unwrap());

        first.release_fairness_lock().unwrap();
        assert!(second.acquire_fairness_lock().unwrap());
    }

    #[test]
    fn test_concurrent_pulls_across_stores_never_share_a_seed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seeds.db");
        let payloads: Vec<String> = (0..200).map(|n| format!("seed-{}", n)).collect();
        SqliteSeedStore::new(&path, Duration::from_secs(30))
            .unwrap()
            .push(&payloads.iter().map(Seed::new).collect::<Vec<_>>())
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store = SqliteSeedStore::new(&path, Duration::from_secs(30)).unwrap();
                    let mut pulled = Vec::new();
                    loop {
                        let batch = store.pull_ready(7).unwrap();
                        if batch.is_empty() {
                            return pulled;
                        }
                        pulled.extend(batch.into_iter().map(|s| s.payload));
                    }
                })
            })
            .collect();

        let mut all: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(all.len(), 200);
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 200);
    }

    #[test]
    fn test_expired_lock_can_be_taken_over() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seeds.db");
        let first = SqliteSeedStore::new(&path, Duration::from_millis(0)).unwrap();
        let second = SqliteSeedStore::new(&path, Duration::from_secs(30)).unwrap();

        assert!(first.acquire_fairness_lock().unwrap());
        std::thread::sleep(Duration::from_millis(5));
        assert!(second.acquire_fairness_lock().unwrap());
    }

    #[test]
    fn test_recover_locked() {
        let store = store();
        store.push(&seeds(&["a", "b"])).unwrap();
        store.pull_ready(2).unwrap();

        assert_eq!(store.recover_locked().unwrap(), 2);
        assert_eq!(store.ready_occupancy().unwrap(), 2);
    }

    #[test]
    fn test_run_lifecycle() {
        let store = store();
        let run_id = store.begin_run("hash").unwrap();

        let latest = store.get_latest_run().unwrap().unwrap();
        assert_eq!(latest.id, run_id);
        assert_eq!(latest.status, RunStatus::Running);

        store.finish_run(run_id, RunStatus::Completed).unwrap();
        let latest = store.get_latest_run().unwrap().unwrap();
        assert_eq!(latest.status, RunStatus::Completed);
        assert!(latest.finished_at.is_some());

        assert!(matches!(
            store.finish_run(run_id + 100, RunStatus::Failed),
            Err(StorageError::RunNotFound(_))
        ));
    }

    #[test]
    fn test_heartbeat_and_clear() {
        let store = store();
        store.heartbeat().unwrap();
        store.heartbeat().unwrap();
        store.push(&seeds(&["a"])).unwrap();
        assert!(store.acquire_fairness_lock().unwrap());

        store.clear().unwrap();

        assert_eq!(store.total_occupancy().unwrap(), 0);
        let lock_rows: i64 = store
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM locks", [], |row| row.get(0))
            .unwrap();
        assert_eq!(lock_rows, 0);
    }
}
