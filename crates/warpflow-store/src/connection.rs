//! `SQLite` connection pool with WAL mode enabled.
//!
//! Uses `r2d2` connection pooling with the `r2d2_sqlite` backend. The
//! [`PragmaCustomizer`] runs on each new connection so WAL journaling,
//! `synchronous = NORMAL`, foreign keys, and the busy timeout are set on
//! every handle the pool hands out.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::errors::{Result, StoreError};

/// Alias for the connection pool type.
pub type ConnectionPool = Pool<SqliteConnectionManager>;

/// Alias for a pooled connection.
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Configuration for the connection pool.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Maximum pool size (default: 8).
    pub pool_size: u32,
    /// Busy timeout in milliseconds (default: 30000).
    pub busy_timeout_ms: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            busy_timeout_ms: 30_000,
        }
    }
}

/// `SQLite` pragma customizer that runs on each new connection.
#[derive(Debug)]
struct PragmaCustomizer {
    busy_timeout_ms: u32,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;\
             PRAGMA busy_timeout = {};\
             PRAGMA foreign_keys = ON;\
             PRAGMA synchronous = NORMAL;",
            self.busy_timeout_ms
        ))?;
        Ok(())
    }
}

/// Create an in-memory connection pool (for testing).
///
/// The pool is pinned to a single connection so every handle sees the same
/// in-memory database.
pub fn new_in_memory() -> Result<ConnectionPool> {
    let manager = SqliteConnectionManager::memory();
    let pool = Pool::builder()
        .max_size(1)
        .connection_timeout(std::time::Duration::from_secs(5))
        .connection_customizer(Box::new(PragmaCustomizer {
            busy_timeout_ms: 5_000,
        }))
        .build(manager)?;
    Ok(pool)
}

/// Create a file-backed connection pool, creating parent directories.
pub fn new_file(path: &str, config: &ConnectionConfig) -> Result<ConnectionPool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::InvalidOperation(
                format!("cannot create database directory {}: {e}", parent.display()),
            ))?;
        }
    }
    let manager = SqliteConnectionManager::file(path);
    let pool = Pool::builder()
        .max_size(config.pool_size)
        .connection_timeout(std::time::Duration::from_secs(5))
        .connection_customizer(Box::new(PragmaCustomizer {
            busy_timeout_ms: config.busy_timeout_ms,
        }))
        .build(manager)?;
    Ok(pool)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_pool_creates_successfully() {
        let pool = new_in_memory().unwrap();
        let conn = pool.get().unwrap();
        let journal: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert!(journal == "wal" || journal == "memory", "got {journal}");
    }

    #[test]
    fn file_pool_enables_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.db");
        let pool = new_file(path.to_str().unwrap(), &ConnectionConfig::default()).unwrap();
        let conn = pool.get().unwrap();
        let journal: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal, "wal");
        let sync: i32 = conn
            .query_row("PRAGMA synchronous", [], |row| row.get(0))
            .unwrap();
        assert_eq!(sync, 1, "synchronous should be NORMAL");
    }

    #[test]
    fn file_pool_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/pool.db");
        let pool = new_file(path.to_str().unwrap(), &ConnectionConfig::default()).unwrap();
        assert!(pool.get().is_ok());
        assert!(path.parent().unwrap().exists());
    }
}
