//! Health repository — SQL for the `health_snapshots` table.

use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::Result;
use crate::row_types::HealthSnapshot;

/// Health repository — stateless, every method takes `&Connection`.
pub struct HealthRepo;

impl HealthRepo {
    /// Insert or replace the snapshot for one account.
    pub fn upsert(conn: &Connection, snapshot: &HealthSnapshot, now: &str) -> Result<()> {
        let _ = conn.execute(
            "INSERT INTO health_snapshots \
                 (account_id, healthy, last_checked_at, last_success_at, \
                  consecutive_failures, latency_ms, last_error, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(account_id) DO UPDATE SET \
                 healthy = excluded.healthy, \
                 last_checked_at = excluded.last_checked_at, \
                 last_success_at = excluded.last_success_at, \
                 consecutive_failures = excluded.consecutive_failures, \
                 latency_ms = excluded.latency_ms, \
                 last_error = excluded.last_error, \
                 updated_at = excluded.updated_at",
            params![
                snapshot.account_id,
                snapshot.healthy,
                snapshot.last_checked_at,
                snapshot.last_success_at,
                snapshot.consecutive_failures,
                snapshot.latency_ms,
                snapshot.last_error,
                now
            ],
        )?;
        Ok(())
    }

    /// Read one snapshot.
    pub fn get(conn: &Connection, account_id: i64) -> Result<Option<HealthSnapshot>> {
        let row = conn
            .query_row(
                "SELECT account_id, healthy, last_checked_at, last_success_at, \
                        consecutive_failures, latency_ms, last_error, updated_at \
                 FROM health_snapshots WHERE account_id = ?1",
                params![account_id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Read all snapshots ordered by account id.
    pub fn list(conn: &Connection) -> Result<Vec<HealthSnapshot>> {
        let mut stmt = conn.prepare(
            "SELECT account_id, healthy, last_checked_at, last_success_at, \
                    consecutive_failures, latency_ms, last_error, updated_at \
             FROM health_snapshots ORDER BY account_id",
        )?;
        let rows = stmt
            .query_map([], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Clear the failure streak after a successful send or refresh.
    pub fn reset_failures(conn: &Connection, account_id: i64, now: &str) -> Result<()> {
        let _ = conn.execute(
            "UPDATE health_snapshots \
             SET healthy = 1, consecutive_failures = 0, last_success_at = ?2, updated_at = ?2 \
             WHERE account_id = ?1",
            params![account_id, now],
        )?;
        Ok(())
    }

    /// Remove the snapshot for a deleted account.
    pub fn delete(conn: &Connection, account_id: i64) -> Result<()> {
        let _ = conn.execute(
            "DELETE FROM health_snapshots WHERE account_id = ?1",
            params![account_id],
        )?;
        Ok(())
    }

    /// `(healthy, unhealthy)` counts over all snapshots.
    pub fn counts(conn: &Connection) -> Result<(i64, i64)> {
        conn.query_row(
            "SELECT COALESCE(SUM(CASE WHEN healthy = 1 THEN 1 ELSE 0 END), 0), \
                    COALESCE(SUM(CASE WHEN healthy = 0 THEN 1 ELSE 0 END), 0) \
             FROM health_snapshots",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(Into::into)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HealthSnapshot> {
        Ok(HealthSnapshot {
            account_id: row.get(0)?,
            healthy: row.get(1)?,
            last_checked_at: row.get(2)?,
            last_success_at: row.get(3)?,
            consecutive_failures: row.get(4)?,
            latency_ms: row.get(5)?,
            last_error: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::new_in_memory;
    use crate::migrations::run_migrations;
    use warpflow_core::time;

    fn setup() -> crate::connection::ConnectionPool {
        let pool = new_in_memory().unwrap();
        run_migrations(&pool.get().unwrap()).unwrap();
        pool
    }

    fn snapshot(account_id: i64, healthy: bool, failures: i64) -> HealthSnapshot {
        HealthSnapshot {
            account_id,
            healthy: Some(healthy),
            last_checked_at: Some(time::now_iso()),
            last_success_at: healthy.then(time::now_iso),
            consecutive_failures: failures,
            latency_ms: Some(120),
            last_error: (!healthy).then(|| "refresh failed".into()),
            updated_at: time::now_iso(),
        }
    }

    #[test]
    fn upsert_replaces_existing() {
        let pool = setup();
        let conn = pool.get().unwrap();
        let now = time::now_iso();
        HealthRepo::upsert(&conn, &snapshot(1, true, 0), &now).unwrap();
        HealthRepo::upsert(&conn, &snapshot(1, false, 2), &now).unwrap();

        let snap = HealthRepo::get(&conn, 1).unwrap().unwrap();
        assert_eq!(snap.healthy, Some(false));
        assert_eq!(snap.consecutive_failures, 2);
        assert_eq!(HealthRepo::list(&conn).unwrap().len(), 1);
    }

    #[test]
    fn counts_split_healthy_and_unhealthy() {
        let pool = setup();
        let conn = pool.get().unwrap();
        let now = time::now_iso();
        HealthRepo::upsert(&conn, &snapshot(1, true, 0), &now).unwrap();
        HealthRepo::upsert(&conn, &snapshot(2, false, 1), &now).unwrap();
        HealthRepo::upsert(&conn, &snapshot(3, false, 4), &now).unwrap();

        assert_eq!(HealthRepo::counts(&conn).unwrap(), (1, 2));
    }

    #[test]
    fn delete_removes_row() {
        let pool = setup();
        let conn = pool.get().unwrap();
        let now = time::now_iso();
        HealthRepo::upsert(&conn, &snapshot(1, true, 0), &now).unwrap();
        HealthRepo::delete(&conn, 1).unwrap();
        assert!(HealthRepo::get(&conn, 1).unwrap().is_none());
    }
}
