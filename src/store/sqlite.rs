// src/store/sqlite.rs

//! SQLite-backed key/value store
//!
//! One `kv` table plus a `schema_version` table for migrations. Each
//! `update` runs in a `BEGIN IMMEDIATE` transaction, which takes SQLite's
//! write lock up front so concurrent processes serialize their
//! read-modify-write cycles instead of racing.

use super::KvStore;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// How long a writer waits for another process's write lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Key/value store in a SQLite file
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::IoError(format!(
                        "Failed to create state directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        migrate(&conn)?;

        debug!("Opened state store at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KvStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock();
        // substr comparison sidesteps LIKE wildcards in identities
        let mut stmt = conn.prepare(
            "SELECT key, value FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;
        let rows = stmt
            .query_map([prefix], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<(String, String)>>>()?;
        Ok(rows)
    }

    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<String>) -> Result<Option<String>>,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<String> = tx
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;

        // Dropping `tx` on error rolls back
        match f(current)? {
            Some(value) => {
                tx.execute(
                    "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, CURRENT_TIMESTAMP)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
                    params![key, value],
                )?;
            }
            None => {
                tx.execute("DELETE FROM kv WHERE key = ?1", [key])?;
            }
        }

        tx.commit()?;
        Ok(())
    }
}

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);

    Ok(version)
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version >= SCHEMA_VERSION {
        debug!("State schema is up to date (version {})", current_version);
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying state schema migration to version {}", version);
        apply_migration(conn, version)?;
        conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        _ => Err(Error::DatabaseError(format!(
            "Unknown migration version: {}",
            version
        ))),
    }
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_schema() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/state.db");

        let store = SqliteStore::open(&path).unwrap();
        assert!(path.exists());

        let conn = store.conn.lock();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.put("sync_state", "{}").unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get("sync_state").unwrap().as_deref(), Some("{}"));
    }

    #[test]
    fn test_scan_prefix_ignores_like_wildcards() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put("rate_limit:10.0.0.1", "a").unwrap();
        store.put("rate_limitXother", "b").unwrap();
        store.put("rate_limit:10.0.0.2", "c").unwrap();

        let found = store.scan_prefix("rate_limit:").unwrap();
        let keys: Vec<_> = found.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["rate_limit:10.0.0.1", "rate_limit:10.0.0.2"]);

        // '_' in a LIKE pattern would match any character
        let found = store.scan_prefix("rate_limit_").unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_update_delete_and_rollback() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put("k", "v1").unwrap();

        let result = store.update("k", &mut |_| Err(Error::ParseError("bad".into())));
        assert!(result.is_err());
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v1"));

        store.update("k", &mut |_| Ok(None)).unwrap();
        assert!(store.get("k").unwrap().is_none());
    }

    #[test]
    fn test_concurrent_updates_serialize() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.db");
        SqliteStore::open(&path).unwrap();

        let path = Arc::new(path);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = Arc::clone(&path);
                thread::spawn(move || {
                    // Separate connections, as separate processes would have
                    let store = SqliteStore::open(path.as_ref()).unwrap();
                    for _ in 0..25 {
                        store
                            .update("counter", &mut |v| {
                                let n: u64 = v.and_then(|s| s.parse().ok()).unwrap_or(0);
                                Ok(Some((n + 1).to_string()))
                            })
                            .unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let store = SqliteStore::open(path.as_ref()).unwrap();
        assert_eq!(store.get("counter").unwrap().as_deref(), Some("100"));
    }
}
