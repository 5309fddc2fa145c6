//! App-state repository — TTL'd key-value SQL for the `app_state` table.
//!
//! Reserved for migration checkpoints and ephemeral process-wide markers
//! (e.g. the selector's rotation cursor). Expired rows are dropped lazily
//! on read.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use warpflow_core::time;

use crate::errors::Result;

/// App-state repository — stateless, every method takes `&Connection`.
pub struct AppStateRepo;

impl AppStateRepo {
    /// Set a key, optionally expiring after `ttl_seconds`.
    pub fn set(
        conn: &Connection,
        key: &str,
        value: &[u8],
        ttl_seconds: Option<i64>,
        now: &str,
    ) -> Result<()> {
        let expires_at = ttl_seconds.map(time::future_iso);
        let _ = conn.execute(
            "INSERT INTO app_state (key, value, expires_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(key) DO UPDATE SET \
                 value = excluded.value, \
                 expires_at = excluded.expires_at, \
                 updated_at = excluded.updated_at",
            params![key, value, expires_at, now],
        )?;
        Ok(())
    }

    /// Get a key; expired entries are deleted and read as absent.
    pub fn get(conn: &Connection, key: &str) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>, Option<String>)> = conn
            .query_row(
                "SELECT value, expires_at FROM app_state WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((value, expires_at)) => {
                let expired = expires_at
                    .as_deref()
                    .is_some_and(|e| !time::is_future(e, Utc::now()));
                if expired {
                    Self::delete(conn, key)?;
                    return Ok(None);
                }
                Ok(Some(value))
            }
        }
    }

    /// Delete a key.
    pub fn delete(conn: &Connection, key: &str) -> Result<()> {
        let _ = conn.execute("DELETE FROM app_state WHERE key = ?1", params![key])?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
