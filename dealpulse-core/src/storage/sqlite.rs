//! SQLite-backed persistent key-value store

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::KeyValueStore;
use crate::error::{Error, Result};

/// Durable store for visitor ids and autosave sessions
///
/// Single connection behind a mutex; writes are tiny and infrequent.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path and run migrations
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        super::schema::run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        super::schema::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn connection(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| Error::Storage(format!("connection poisoned: {}", e)))
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.connection()?;
        conn.query_row("SELECT value FROM kv WHERE key = ?", [key], |row| {
            row.get::<_, String>(0)
        })
        .optional()
        .map_err(Error::from)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            r#"
            INSERT INTO kv (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM kv WHERE key = ?", [key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_overwrites_existing_value() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set("visitor", "one").unwrap();
        store.set("visitor", "two").unwrap();
        assert_eq!(store.get("visitor").unwrap().as_deref(), Some("two"));
    }

    #[test]
    fn test_remove_missing_key_is_ok() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.remove("nope").unwrap();
        assert_eq!(store.get("nope").unwrap(), None);
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/storage.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.set("dealpulse.visitor_id", "v-1").unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(
            store.get("dealpulse.visitor_id").unwrap().as_deref(),
            Some("v-1")
        );
    }
}
