//! SQLite-based sink implementation
//!
//! Every batch is written inside one transaction, so a failed batch leaves
//! no partial rows behind.

use crate::output::traits::{OutputError, OutputResult, SinkBackend};
use crate::state::Item;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const SINK_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    destination TEXT NOT NULL,
    record TEXT NOT NULL,
    stored_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_items_destination ON items(destination);
"#;

/// SQLite item sink
///
/// One instance can serve several destinations; the destination is stored
/// alongside every record.
pub struct SqliteSink {
    conn: Mutex<Connection>,
}

impl SqliteSink {
    /// Opens or creates the item database at `path`
    pub fn new(path: &Path) -> OutputResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
        ",
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SINK_SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory item database
    pub fn new_in_memory() -> OutputResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SINK_SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> OutputResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| OutputError::Poisoned)
    }

    /// Counts stored items per destination
    pub fn count_by_destination(&self) -> OutputResult<HashMap<String, u64>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT destination, COUNT(*) FROM items GROUP BY destination")?;
        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(counts)
    }

    /// Loads every record stored for `destination`, oldest first
    pub fn records(&self, destination: &str) -> OutputResult<Vec<serde_json::Value>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT record FROM items WHERE destination = ?1 ORDER BY id")?;
        let raw = stmt
            .query_map(params![destination], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        raw.iter()
            .map(|text| serde_json::from_str(text).map_err(OutputError::from))
            .collect()
    }
}

impl SinkBackend for SqliteSink {
    fn store(&self, items: &[Item]) -> OutputResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        {
            let mut insert = tx.prepare(
                "INSERT INTO items (destination, record, stored_at) VALUES (?1, ?2, ?3)",
            )?;
            for item in items {
                let record = serde_json::to_string(&item.record)?;
                insert.execute(params![item.destination, record, now])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_store_and_count() {
        let sink = SqliteSink::new_in_memory().unwrap();
        sink.store(&[
            Item::new("articles", json!({"id": 1})),
            Item::new("articles", json!({"id": 2})),
            Item::new("authors", json!({"name": "Ada"})),
        ])
        .unwrap();

        let counts = sink.count_by_destination().unwrap();
        assert_eq!(counts.get("articles"), Some(&2));
        assert_eq!(counts.get("authors"), Some(&1));
    }

    #[test]
    fn test_records_roundtrip_in_order() {
        let sink = SqliteSink::new_in_memory().unwrap();
        sink.store(&[Item::new("articles", json!({"id": 1}))]).unwrap();
        sink.store(&[Item::new("articles", json!({"id": 2}))]).unwrap();

        let records = sink.records("articles").unwrap();
        assert_eq!(records, vec![json!({"id": 1}), json!({"id": 2})]);
        assert!(sink.records("authors").unwrap().is_empty());
    }

    #[test]
    fn test_empty_batch_is_a_no_op() {
        let sink = SqliteSink::new_in_memory().unwrap();
        sink.store(&[]).unwrap();
        assert!(sink.count_by_destination().unwrap().is_empty());
    }

    #[test]
    fn test_on_disk_sink_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("items.db");
        {
            let sink = SqliteSink::new(&path).unwrap();
            sink.store(&[Item::new("articles", json!("kept"))]).unwrap();
        }

        let reopened = SqliteSink::new(&path).unwrap();
        assert_eq!(reopened.records("articles").unwrap(), vec![json!("kept")]);
    }
}
