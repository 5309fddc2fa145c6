//! Audit repository — append-only SQL for the `audit_events` table.
//!
//! Rows are never updated or deleted; the log is immortal for the life of
//! the database.

use rusqlite::{params, Connection};
use serde_json::Value;

use crate::errors::Result;
use crate::row_types::{AuditEntry, AuditEvent, AuditFilter};

/// Hard cap on a single audit page.
const MAX_PAGE: u32 = 500;

/// Audit repository — stateless, every method takes `&Connection`.
pub struct AuditRepo;

impl AuditRepo {
    /// Append one event.
    pub fn append(conn: &Connection, entry: &AuditEntry, now: &str) -> Result<i64> {
        let detail = serde_json::to_string(&entry.detail)?;
        let _ = conn.execute(
            "INSERT INTO audit_events (account_id, actor, action, outcome, detail, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.account_id,
                entry.actor.as_str(),
                entry.action,
                entry.outcome,
                detail,
                now
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Read the newest events first, optionally filtered, capped at
    /// [`MAX_PAGE`].
    pub fn list(conn: &Connection, filter: &AuditFilter, limit: u32) -> Result<Vec<AuditEvent>> {
        let limit = limit.clamp(1, MAX_PAGE);
        let mut stmt = conn.prepare(
            "SELECT id, account_id, actor, action, outcome, detail, created_at \
             FROM audit_events \
             WHERE (?1 IS NULL OR account_id = ?1) \
               AND (?2 IS NULL OR action = ?2) \
             ORDER BY id DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(
                params![filter.account_id, filter.action, limit],
                Self::map_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEvent> {
        let detail_raw: String = row.get(5)?;
        Ok(AuditEvent {
            id: row.get(0)?,
            account_id: row.get(1)?,
            actor: row.get(2)?,
            action: row.get(3)?,
            outcome: row.get(4)?,
            detail: serde_json::from_str(&detail_raw).unwrap_or(Value::Null),
            created_at: row.get(6)?,
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
    use serde_json::json;
    use warpflow_core::time;
    use warpflow_core::Actor;

    fn setup() -> crate::connection::ConnectionPool {
        let pool = new_in_memory().unwrap();
        run_migrations(&pool.get().unwrap()).unwrap();
        pool
    }

    fn entry(account_id: Option<i64>, action: &str) -> AuditEntry {
        AuditEntry::new(account_id, Actor::Runtime, action, "ok", json!({"k": 1}))
    }

    #[test]
    fn append_and_read_back() {
        let pool = setup();
        let conn = pool.get().unwrap();
        let now = time::now_iso();
        AuditRepo::append(&conn, &entry(Some(1), "dispatch_send"), &now).unwrap();

        let events = AuditRepo::list(&conn, &AuditFilter::default(), 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "dispatch_send");
        assert_eq!(events[0].actor, "runtime");
        assert_eq!(events[0].detail["k"], 1);
    }

    #[test]
    fn newest_first_and_limit() {
        let pool = setup();
        let conn = pool.get().unwrap();
        let now = time::now_iso();
        for i in 0..5 {
            AuditRepo::append(&conn, &entry(Some(i), "a"), &now).unwrap();
        }
        let events = AuditRepo::list(&conn, &AuditFilter::default(), 3).unwrap();
        assert_eq!(events.len(), 3);
        assert!(events[0].id > events[1].id);
    }

    #[test]
    fn filter_by_account_and_action() {
        let pool = setup();
        let conn = pool.get().unwrap();
        let now = time::now_iso();
        AuditRepo::append(&conn, &entry(Some(1), "refresh"), &now).unwrap();
        AuditRepo::append(&conn, &entry(Some(2), "refresh"), &now).unwrap();
        AuditRepo::append(&conn, &entry(Some(1), "delete"), &now).unwrap();

        let by_account = AuditRepo::list(
            &conn,
            &AuditFilter {
                account_id: Some(1),
                action: None,
            },
            10,
        )
        .unwrap();
        assert_eq!(by_account.len(), 2);

        let by_action = AuditRepo::list(
            &conn,
            &AuditFilter {
                account_id: Some(1),
                action: Some("refresh".into()),
            },
            10,
        )
        .unwrap();
        assert_eq!(by_action.len(), 1);
    }

    #[test]
    fn limit_is_clamped() {
        let pool = setup();
        let conn = pool.get().unwrap();
        let now = time::now_iso();
        AuditRepo::append(&conn, &entry(None, "a"), &now).unwrap();
        // Zero is clamped up to one, not rejected.
        let events = AuditRepo::list(&conn, &AuditFilter::default(), 0).unwrap();
        assert_eq!(events.len(), 1);
    }
}
