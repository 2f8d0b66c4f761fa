//! SQLite-backed storage.
//!
//! Stores the same JSON document as [`crate::json_storage`], one row per
//! session. Each save runs in its own transaction, so replacement is atomic.

use std::path::Path;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use parley_core::{Session, StorageError};

use crate::storage::{Result, SessionStorage};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id          TEXT PRIMARY KEY NOT NULL,
    document    TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
"#;

fn db_err(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

/// One-row-per-session SQLite storage.
pub struct SqliteStorage {
    /// Database connection; `None` once closed.
    conn: Mutex<Option<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        Self::init(conn)
    }

    /// In-memory database, useful for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        // WAL gives readers a stable view while a save commits
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
            .map_err(db_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or(StorageError::Closed)?;
        f(conn)
    }
}

impl SessionStorage for SqliteStorage {
    fn save(&self, session: &Session) -> Result<()> {
        let document = serde_json::to_string(session)?;

        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(db_err)?;
            tx.execute(
                "INSERT OR REPLACE INTO sessions (id, document, updated_at) VALUES (?1, ?2, ?3)",
                params![session.id(), document, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)
        })
    }

    fn load(&self, id: &str) -> Result<Option<Session>> {
        let document: Option<String> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT document FROM sessions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)
        })?;

        match document {
            Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
            None => Ok(None),
        }
    }

    fn load_all(&self) -> Result<Vec<Session>> {
        let rows: Vec<(String, String)> = self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, document FROM sessions")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })?;

        let mut sessions = Vec::with_capacity(rows.len());
        for (id, document) in rows {
            match serde_json::from_str::<Session>(&document) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "Skipping unreadable session row");
                }
            }
        }

        Ok(sessions)
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])
                .map_err(db_err)?;
            Ok(())
        })
    }

    fn exists(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM sessions WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            Ok(found.is_some())
        })
    }

    fn close(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().take() {
            conn.close().map_err(|(_, e)| db_err(e))?;
        }
        Ok(())
    }
}
