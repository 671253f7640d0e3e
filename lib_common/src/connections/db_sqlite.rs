//! # SQLite Connection Manager
//!
//! Provides a managed connection to an embedded SQLite database using the
//! `rusqlite` crate. The file is opened once per process; concurrent access
//! from multiple tasks is serialized through an internal mutex, and writes
//! are further serialized by SQLite itself.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Custom error types for Database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Failed to open database: {0}")]
    ConnectionError(String),
    #[error("Query execution failed: {0}")]
    QueryError(String),
}

/// A wrapper around a single SQLite connection, cheap to clone and share
/// between tasks.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (creating if necessary) the database file at `path` and applies
    /// the standard pragmas: WAL journaling, foreign keys, a busy timeout.
    ///
    /// # Arguments
    /// * `path` - Filesystem path of the database file.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)
            .map_err(|e| DbError::ConnectionError(e.to_string()))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| DbError::ConnectionError(e.to_string()))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| DbError::ConnectionError(e.to_string()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| DbError::ConnectionError(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` with exclusive access to the underlying connection.
    ///
    /// The closure receives a mutable reference so callers can open
    /// transactions. Lock poisoning is reported as a `QueryError` rather
    /// than propagating the panic.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T, DbError> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| DbError::QueryError("connection lock poisoned".to_string()))?;
        f(&mut guard).map_err(|e| DbError::QueryError(e.to_string()))
    }

    /// Checks the health of the database connection by running a simple query.
    pub fn ping(&self) -> Result<(), DbError> {
        self.with_conn(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_and_ping() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("test.db")).unwrap();
        db.ping().unwrap();
    }

    #[test]
    fn with_conn_propagates_errors() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("test.db")).unwrap();
        let result = db.with_conn(|conn| conn.execute_batch("NOT VALID SQL"));
        assert!(matches!(result, Err(DbError::QueryError(_))));
    }
}
