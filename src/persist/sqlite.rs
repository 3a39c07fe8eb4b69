//! SQLite-backed key/value persistence adapter.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use crate::clock::now_ms;

use super::{PersistenceAdapter, PersistResult};

/// SQLite implementation of [`crate::persist::PersistenceAdapter`].
pub struct SqliteAdapter {
    conn: Connection,
}

impl SqliteAdapter {
    /// Opens or creates a SQLite-backed adapter at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory SQLite adapter.
    pub fn open_in_memory() -> PersistResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> PersistResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self { conn })
    }

    /// Lists stored keys in lexical order.
    pub fn keys(&self) -> PersistResult<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT key FROM kv ORDER BY key ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

impl PersistenceAdapter for SqliteAdapter {
    fn get(&self, key: &str) -> PersistResult<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&mut self, key: &str, value: &str) -> PersistResult<()> {
        self.conn.execute(
            "INSERT INTO kv(key, value, updated_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_ms = excluded.updated_ms",
            params![key, value, now_ms() as i64],
        )?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> PersistResult<()> {
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }
}
