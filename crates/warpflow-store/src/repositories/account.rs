//! Account repository — SQL for the `accounts` table.

use rusqlite::{params, Connection, OptionalExtension};

use warpflow_core::{AccountStatus, QuotaSnapshot};

use crate::errors::Result;
use crate::row_types::Account;

/// Columns selected for every account read, in `map_row` order.
const ACCOUNT_COLUMNS: &str = "id, label, email, token_fingerprint, refresh_token_sealed, \
     token_preview, access_token, access_token_expires_at, status, use_count, error_count, \
     last_error_code, last_error_message, last_success_at, last_check_at, cooldown_until, \
     quota_limit, quota_used, quota_remaining, quota_is_unlimited, quota_next_refresh_time, \
     quota_refresh_duration, quota_updated_at, created_at, updated_at";

/// Account repository — stateless, every method takes `&Connection`.
pub struct AccountRepo;

impl AccountRepo {
    /// Insert a new account. Returns `None` when the fingerprint already
    /// exists (the unique index absorbs the conflict).
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        conn: &Connection,
        fingerprint: &str,
        sealed: &[u8],
        preview: &str,
        label: Option<&str>,
        email: Option<&str>,
        now: &str,
    ) -> Result<Option<i64>> {
        let changed = conn.execute(
            "INSERT OR IGNORE INTO accounts \
                 (token_fingerprint, refresh_token_sealed, token_preview, label, email, \
                  status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?6)",
            params![fingerprint, sealed, preview, label, email, now],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    /// Get one account by id.
    pub fn get(conn: &Connection, id: i64) -> Result<Option<Account>> {
        let row = conn
            .query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                params![id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// List all accounts ordered by id.
    pub fn list(conn: &Connection) -> Result<Vec<Account>> {
        let mut stmt =
            conn.prepare(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY id"))?;
        let rows = stmt
            .query_map([], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Find an account id by refresh-token fingerprint.
    pub fn find_id_by_fingerprint(conn: &Connection, fingerprint: &str) -> Result<Option<i64>> {
        let id = conn
            .query_row(
                "SELECT id FROM accounts WHERE token_fingerprint = ?1",
                params![fingerprint],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Record a successful send or refresh: reset error bookkeeping, clear
    /// any cooldown, and stamp the success instant.
    pub fn record_success(conn: &Connection, id: i64, bump_use: bool, now: &str) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE accounts SET \
                 status = 'active', error_count = 0, last_error_code = NULL, \
                 last_error_message = NULL, last_success_at = ?2, last_check_at = ?2, \
                 cooldown_until = NULL, \
                 use_count = use_count + (CASE WHEN ?3 THEN 1 ELSE 0 END), \
                 updated_at = ?2 \
             WHERE id = ?1",
            params![id, now, bump_use],
        )?;
        Ok(changed == 1)
    }

    /// Record a failed attempt with its classified status transition.
    ///
    /// When `zero_out_quota` is set (quota-exhaustion signals), the quota
    /// counters are forced to "nothing remaining" so readiness and the
    /// selector agree with the upstream verdict immediately.
    #[allow(clippy::too_many_arguments)]
    pub fn record_failure(
        conn: &Connection,
        id: i64,
        status: AccountStatus,
        error_count: i64,
        code: &str,
        message: &str,
        cooldown_until: Option<&str>,
        zero_out_quota: bool,
        now: &str,
    ) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE accounts SET \
                 status = ?2, error_count = ?3, last_error_code = ?4, \
                 last_error_message = ?5, last_check_at = ?6, cooldown_until = ?7, \
                 quota_remaining = CASE WHEN ?8 THEN 0 ELSE quota_remaining END, \
                 quota_used = CASE WHEN ?8 AND quota_limit >= 0 THEN quota_limit \
                                   ELSE quota_used END, \
                 quota_updated_at = CASE WHEN ?8 THEN ?6 ELSE quota_updated_at END, \
                 updated_at = ?6 \
             WHERE id = ?1",
            params![
                id,
                status.as_str(),
                error_count,
                code,
                message,
                now,
                cooldown_until,
                zero_out_quota
            ],
        )?;
        Ok(changed == 1)
    }

    /// Store a fresh access token and its expiry.
    pub fn set_access_token(
        conn: &Connection,
        id: i64,
        access_token: &str,
        expires_at: &str,
        now: &str,
    ) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE accounts SET access_token = ?2, access_token_expires_at = ?3, \
                 updated_at = ?4 \
             WHERE id = ?1",
            params![id, access_token, expires_at, now],
        )?;
        Ok(changed == 1)
    }

    /// Store a quota snapshot.
    pub fn set_quota(conn: &Connection, id: i64, quota: &QuotaSnapshot, now: &str) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE accounts SET \
                 quota_limit = ?2, quota_used = ?3, quota_remaining = ?4, \
                 quota_is_unlimited = ?5, quota_next_refresh_time = ?6, \
                 quota_refresh_duration = ?7, quota_updated_at = ?8, updated_at = ?8 \
             WHERE id = ?1",
            params![
                id,
                quota.limit,
                quota.used,
                quota.remaining,
                quota.is_unlimited,
                quota.next_refresh_time,
                quota.refresh_duration,
                now
            ],
        )?;
        Ok(changed == 1)
    }

    /// Replace the stored refresh token after upstream rotated it.
    pub fn rotate_refresh_token(
        conn: &Connection,
        id: i64,
        fingerprint: &str,
        sealed: &[u8],
        preview: &str,
        now: &str,
    ) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE accounts SET token_fingerprint = ?2, refresh_token_sealed = ?3, \
                 token_preview = ?4, updated_at = ?5 \
             WHERE id = ?1",
            params![id, fingerprint, sealed, preview, now],
        )?;
        Ok(changed == 1)
    }

    /// Apply operator-controlled fields. Returns whether the row exists.
    pub fn set_admin_fields(
        conn: &Connection,
        id: i64,
        label: Option<&str>,
        status: Option<AccountStatus>,
        now: &str,
    ) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE accounts SET \
                 label = COALESCE(?2, label), \
                 status = COALESCE(?3, status), \
                 cooldown_until = CASE WHEN ?3 = 'active' THEN NULL ELSE cooldown_until END, \
                 updated_at = ?4 \
             WHERE id = ?1",
            params![id, label, status.map(AccountStatus::as_str), now],
        )?;
        Ok(changed == 1)
    }

    /// Delete one account. Returns whether a row was removed.
    pub fn delete(conn: &Connection, id: i64) -> Result<bool> {
        let changed = conn.execute("DELETE FROM accounts WHERE id = ?1", params![id])?;
        Ok(changed == 1)
    }

    /// Counts per status string.
    pub fn count_by_status(conn: &Connection) -> Result<Vec<(String, i64)>> {
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM accounts GROUP BY status ORDER BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Generate a unique `tk-<hex>` label for an imported account.
    pub fn generate_unique_label(conn: &Connection) -> Result<String> {
        use rand::Rng;
        for _ in 0..8 {
            let bytes: [u8; 4] = rand::thread_rng().gen();
            let candidate = format!(
                "tk-{:02x}{:02x}{:02x}{:02x}",
                bytes[0], bytes[1], bytes[2], bytes[3]
            );
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM accounts WHERE label = ?1 LIMIT 1",
                    params![candidate],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Ok(candidate);
            }
        }
        let bytes: [u8; 8] = rand::thread_rng().gen();
        let mut suffix = String::with_capacity(16);
        for b in bytes {
            use std::fmt::Write;
            let _ = write!(suffix, "{b:02x}");
        }
        Ok(format!("tk-{suffix}"))
    }

    /// Map a rusqlite row to [`Account`].
    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
        let status_raw: String = row.get(8)?;
        let quota_updated_at: Option<String> = row.get(22)?;
        let quota = quota_updated_at.as_ref().map(|_| {
            let limit: Option<i64> = row.get(16).ok().flatten();
            let used: Option<i64> = row.get(17).ok().flatten();
            let remaining: Option<i64> = row.get(18).ok().flatten();
            QuotaSnapshot {
                limit: limit.unwrap_or(0),
                used: used.unwrap_or(0),
                remaining: remaining.unwrap_or(0),
                is_unlimited: row.get::<_, i64>(19).unwrap_or(0) == 1,
                next_refresh_time: row.get(20).ok().flatten(),
                refresh_duration: row.get(21).ok().flatten(),
            }
        });
        Ok(Account {
            id: row.get(0)?,
            label: row.get(1)?,
            email: row.get(2)?,
            token_fingerprint: row.get(3)?,
            refresh_token_sealed: row.get(4)?,
            token_preview: row.get(5)?,
            access_token: row.get(6)?,
            access_token_expires_at: row.get(7)?,
            status: AccountStatus::parse(&status_raw).unwrap_or(AccountStatus::Disabled),
            use_count: row.get(9)?,
            error_count: row.get(10)?,
            last_error_code: row.get(11)?,
            last_error_message: row.get(12)?,
            last_success_at: row.get(13)?,
            last_check_at: row.get(14)?,
            cooldown_until: row.get(15)?,
            quota,
            quota_updated_at,
            created_at: row.get(23)?,
            updated_at: row.get(24)?,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
