//! SQLite-backed key/value store for the local cache

use crate::backend::KvBackend;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
";

/// Persistent backend: one row per cache key
pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    /// Open or create the cache database
    ///
    /// # Arguments
    /// * `path` - Path to the SQLite database file; parent directories are created
    pub fn open(path: &Path) -> crate::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;

        tracing::info!("Cache database opened at {:?}", path);
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> crate::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }
}

impl KvBackend for SqliteBackend {
    fn get(&self, key: &str) -> crate::Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&mut self, key: &str, value: &str) -> crate::Result<()> {
        let updated_at = chrono::Utc::now().timestamp_millis();
        self.conn.execute(
            "INSERT INTO kv (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            params![key, value, updated_at],
        )?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> crate::Result<()> {
        self.conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(())
    }

    fn keys(&self, prefix: &str) -> crate::Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;

        let keys = stmt
            .query_map([prefix], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_and_get() {
        let mut backend = SqliteBackend::open_in_memory().unwrap();
        assert_eq!(backend.get("t1/c1/students").unwrap(), None);

        backend.set("t1/c1/students", "[1]").unwrap();
        backend.set("t1/c1/students", "[1,2]").unwrap();
        assert_eq!(
            backend.get("t1/c1/students").unwrap().as_deref(),
            Some("[1,2]")
        );

        backend.remove("t1/c1/students").unwrap();
        assert_eq!(backend.get("t1/c1/students").unwrap(), None);
    }

    #[test]
    fn test_survives_reopen() {
        let temp = assert_fs::TempDir::new().unwrap();
        let path = temp.path().join("nested/cache.db");

        {
            let mut backend = SqliteBackend::open(&path).unwrap();
            backend.set("_queue", "[]").unwrap();
            backend.set("t1/c1/praise_log", "[]").unwrap();
        }

        let backend = SqliteBackend::open(&path).unwrap();
        assert_eq!(backend.get("_queue").unwrap().as_deref(), Some("[]"));
        assert_eq!(backend.keys("t1/").unwrap(), vec!["t1/c1/praise_log".to_string()]);
    }
}
