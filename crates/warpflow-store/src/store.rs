//! High-level transactional [`AccountStore`] API.
//!
//! Composes the repositories into atomic operations: a status transition,
//! its counter bumps, and its audit entry always commit in one `SQLite`
//! transaction, so readers never observe partial state. The store
//! exclusively owns the connection pool and the crypto box; every other
//! component holds account ids only.

use serde_json::json;
use tracing::warn;

use warpflow_core::mask::token_preview;
use warpflow_core::time;
use warpflow_core::{AccountStatus, Actor, QuotaSnapshot};

use crate::connection::{self, ConnectionConfig, ConnectionPool, PooledConnection};
use crate::crypto::{fingerprint, CryptoBox, CryptoError};
use crate::errors::{Result, StoreError};
use crate::migrations::run_migrations;
use crate::repositories::{AccountRepo, AppStateRepo, AuditRepo, HealthRepo};
use crate::row_types::{
    Account, AuditEntry, AuditEvent, AuditFilter, HealthSnapshot, ImportOutcome, ImportSpec,
    ImportSummary, PoolStatistics, RefreshPersisted,
};

/// Fields applied when an attempt against an account failed.
#[derive(Clone, Debug)]
pub struct FailureUpdate {
    /// Status the account transitions to.
    pub status: AccountStatus,
    /// RFC 3339 end of the cooldown window, if one applies.
    pub cooldown_until: Option<String>,
    /// Machine-readable failure code.
    pub code: String,
    /// Human-readable failure message.
    pub message: String,
    /// Force quota counters to "nothing remaining".
    pub zero_out_quota: bool,
    /// Whether this failure counts against `error_count`.
    pub bump_error_count: bool,
}

/// Fields persisted after a successful identity-provider refresh.
#[derive(Clone, Debug)]
pub struct RefreshSuccess {
    /// Replacement refresh token, when upstream rotated it.
    pub rotated_refresh_token: Option<String>,
    /// Fresh access token.
    pub access_token: String,
    /// RFC 3339 expiry of the access token.
    pub expires_at: String,
    /// Quota snapshot taken right after the refresh, if the probe worked.
    pub quota: Option<QuotaSnapshot>,
}

/// Process-wide account store. One instance owns the `SQLite` handle.
pub struct AccountStore {
    pool: ConnectionPool,
    crypto: CryptoBox,
}

impl AccountStore {
    /// Open a file-backed store and run pending migrations.
    pub fn open_file(path: &str, config: &ConnectionConfig, crypto: CryptoBox) -> Result<Self> {
        let pool = connection::new_file(path, config)?;
        run_migrations(&*pool.get()?)?;
        Ok(Self { pool, crypto })
    }

    /// Open an in-memory store (tests) and run migrations.
    pub fn open_in_memory(crypto: CryptoBox) -> Result<Self> {
        let pool = connection::new_in_memory()?;
        run_migrations(&*pool.get()?)?;
        Ok(Self { pool, crypto })
    }

    fn conn(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    // ── Reads ────────────────────────────────────────────────────────────

    /// List all accounts.
    pub fn list(&self) -> Result<Vec<Account>> {
        AccountRepo::list(&*self.conn()?)
    }

    /// Get one account.
    pub fn get(&self, id: i64) -> Result<Option<Account>> {
        AccountRepo::get(&*self.conn()?, id)
    }

    /// Get one account, failing if absent.
    pub fn require(&self, id: i64) -> Result<Account> {
        self.get(id)?.ok_or(StoreError::AccountNotFound(id))
    }

    /// Find an account by refresh-token fingerprint.
    pub fn find_by_fingerprint(&self, fp: &str) -> Result<Option<Account>> {
        let conn = self.conn()?;
        match AccountRepo::find_id_by_fingerprint(&conn, fp)? {
            Some(id) => AccountRepo::get(&conn, id),
            None => Ok(None),
        }
    }

    /// Decrypt the refresh token for one account.
    ///
    /// A failed decryption is fatal for this record only: the account is
    /// marked `disabled` with `last_error_code = "decrypt_failed"` (audited)
    /// and the error propagates. The rest of the pool is unaffected.
    pub fn refresh_token_plaintext(&self, account: &Account) -> Result<String> {
        match self.crypto.open(&account.refresh_token_sealed) {
            Ok(token) => Ok(token),
            Err(err) => {
                self.mark_decrypt_failed(account.id, &err)?;
                Err(err.into())
            }
        }
    }

    // ── Import / delete ──────────────────────────────────────────────────

    /// Import a batch of accounts, deduplicating by fingerprint.
    ///
    /// Runs in a single transaction; one audit entry summarizes the batch.
    pub fn batch_import(&self, specs: &[ImportSpec], actor: Actor) -> Result<ImportSummary> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let now = time::now_iso();
        let mut summary = ImportSummary::default();

        for spec in specs {
            let token = spec.refresh_token.trim().trim_matches(['\'', '"']);
            let preview = token_preview(token);
            if token.is_empty() {
                summary.errors += 1;
                summary.rows.push((
                    preview,
                    ImportOutcome::Invalid {
                        reason: "empty refresh token".into(),
                    },
                ));
                continue;
            }

            let fp = fingerprint(token);
            let sealed = self.crypto.seal(token)?;
            let label = match &spec.label {
                Some(l) if !l.trim().is_empty() => l.trim().to_string(),
                _ => AccountRepo::generate_unique_label(&tx)?,
            };

            match AccountRepo::insert(
                &tx,
                &fp,
                &sealed,
                &preview,
                Some(&label),
                spec.email.as_deref(),
                &now,
            )? {
                Some(id) => {
                    summary.inserted += 1;
                    summary.rows.push((preview, ImportOutcome::Inserted { id }));
                }
                None => {
                    let existing_id =
                        AccountRepo::find_id_by_fingerprint(&tx, &fp)?.unwrap_or_default();
                    summary.duplicates += 1;
                    summary
                        .rows
                        .push((preview, ImportOutcome::Duplicate { existing_id }));
                }
            }
        }

        self.append_audit_in_tx(
            &tx,
            &AuditEntry::new(
                None,
                actor,
                "batch_import",
                "ok",
                json!({
                    "inserted": summary.inserted,
                    "duplicates": summary.duplicates,
                    "errors": summary.errors,
                }),
            ),
            &now,
        );
        tx.commit()?;
        Ok(summary)
    }

    /// Import one account.
    pub fn insert(&self, spec: &ImportSpec, actor: Actor) -> Result<ImportOutcome> {
        let summary = self.batch_import(std::slice::from_ref(spec), actor)?;
        let (_, outcome) = summary
            .rows
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::InvalidOperation("empty import".into()))?;
        Ok(outcome)
    }

    /// Delete one account (and its health snapshot). Audited.
    pub fn delete(&self, id: i64, actor: Actor) -> Result<bool> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let now = time::now_iso();
        let deleted = AccountRepo::delete(&tx, id)?;
        if deleted {
            HealthRepo::delete(&tx, id)?;
            self.append_audit_in_tx(
                &tx,
                &AuditEntry::new(Some(id), actor, "delete_account", "ok", json!({})),
                &now,
            );
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// Delete many accounts. Returns `(requested, deleted)`.
    pub fn batch_delete(&self, ids: &[i64], actor: Actor) -> Result<(usize, usize)> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let now = time::now_iso();
        let mut deleted = 0;
        for &id in ids {
            if AccountRepo::delete(&tx, id)? {
                HealthRepo::delete(&tx, id)?;
                deleted += 1;
            }
        }
        self.append_audit_in_tx(
            &tx,
            &AuditEntry::new(
                None,
                actor,
                "batch_delete",
                "ok",
                json!({ "requested": ids.len(), "deleted": deleted }),
            ),
            &now,
        );
        tx.commit()?;
        Ok((ids.len(), deleted))
    }

    // ── Admin mutation ───────────────────────────────────────────────────

    /// Patch operator-controlled fields. A patch to the current values is a
    /// no-op that still answers with the account.
    pub fn update_admin(
        &self,
        id: i64,
        label: Option<&str>,
        status: Option<AccountStatus>,
        actor: Actor,
    ) -> Result<Account> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let now = time::now_iso();
        let before = AccountRepo::get(&tx, id)?.ok_or(StoreError::AccountNotFound(id))?;

        let label_changed = label.is_some_and(|l| Some(l) != before.label.as_deref());
        let status_changed = status.is_some_and(|s| s != before.status);
        if label_changed || status_changed {
            let _ = AccountRepo::set_admin_fields(&tx, id, label, status, &now)?;
            self.append_audit_in_tx(
                &tx,
                &AuditEntry::new(
                    Some(id),
                    actor,
                    "update_account",
                    "ok",
                    json!({
                        "label": label,
                        "status": status.map(AccountStatus::as_str),
                    }),
                ),
                &now,
            );
        }

        let after = AccountRepo::get(&tx, id)?.ok_or(StoreError::AccountNotFound(id))?;
        tx.commit()?;
        Ok(after)
    }

    // ── Runtime transitions ──────────────────────────────────────────────

    /// Record a successful send or refresh.
    ///
    /// Resets `error_count`, clears cooldown, stamps `last_success_at`, and
    /// (for sends) bumps `use_count` — all with the audit entry in one
    /// transaction.
    pub fn record_success(
        &self,
        id: i64,
        bump_use: bool,
        actor: Actor,
        action: &str,
    ) -> Result<Account> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let now = time::now_iso();
        if !AccountRepo::record_success(&tx, id, bump_use, &now)? {
            return Err(StoreError::AccountNotFound(id));
        }
        HealthRepo::reset_failures(&tx, id, &now)?;
        self.append_audit_in_tx(
            &tx,
            &AuditEntry::new(Some(id), actor, action, "ok", json!({})),
            &now,
        );
        let account = AccountRepo::get(&tx, id)?.ok_or(StoreError::AccountNotFound(id))?;
        tx.commit()?;
        Ok(account)
    }

    /// Record a failed attempt and its classified transition.
    pub fn record_failure(
        &self,
        id: i64,
        update: &FailureUpdate,
        actor: Actor,
        action: &str,
    ) -> Result<Account> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let now = time::now_iso();
        let before = AccountRepo::get(&tx, id)?.ok_or(StoreError::AccountNotFound(id))?;
        let error_count = if update.bump_error_count {
            before.error_count + 1
        } else {
            before.error_count
        };

        let _ = AccountRepo::record_failure(
            &tx,
            id,
            update.status,
            error_count,
            &update.code,
            &update.message,
            update.cooldown_until.as_deref(),
            update.zero_out_quota,
            &now,
        )?;
        self.append_audit_in_tx(
            &tx,
            &AuditEntry::new(
                Some(id),
                actor,
                action,
                update.code.clone(),
                json!({
                    "status": update.status.as_str(),
                    "error_count": error_count,
                    "cooldown_until": update.cooldown_until,
                    "message": update.message,
                }),
            ),
            &now,
        );
        let account = AccountRepo::get(&tx, id)?.ok_or(StoreError::AccountNotFound(id))?;
        tx.commit()?;
        Ok(account)
    }

    /// Persist a successful refresh: new access token, optional rotated
    /// refresh token, and the post-refresh quota snapshot.
    ///
    /// When the rotated refresh token already belongs to another account,
    /// the result is applied to that account and the source row is merged
    /// away (deleted), mirroring upstream's own deduplication.
    pub fn record_refresh_success(
        &self,
        id: i64,
        success: &RefreshSuccess,
        actor: Actor,
    ) -> Result<RefreshPersisted> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let now = time::now_iso();
        let account = AccountRepo::get(&tx, id)?.ok_or(StoreError::AccountNotFound(id))?;

        let mut target = id;
        let mut merged_from = None;

        if let Some(rotated) = success
            .rotated_refresh_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            let fp = fingerprint(rotated);
            if fp != account.token_fingerprint {
                match AccountRepo::find_id_by_fingerprint(&tx, &fp)? {
                    Some(existing) if existing != id => {
                        // Upstream handed us a token we already track: fold
                        // this row into the existing account.
                        target = existing;
                        merged_from = Some(id);
                        let _ = AccountRepo::delete(&tx, id)?;
                        HealthRepo::delete(&tx, id)?;
                    }
                    _ => {
                        let sealed = self.crypto.seal(rotated)?;
                        let _ = AccountRepo::rotate_refresh_token(
                            &tx,
                            id,
                            &fp,
                            &sealed,
                            &token_preview(rotated),
                            &now,
                        )?;
                    }
                }
            }
        }

        let _ = AccountRepo::set_access_token(
            &tx,
            target,
            &success.access_token,
            &success.expires_at,
            &now,
        )?;
        if let Some(quota) = &success.quota {
            let _ = AccountRepo::set_quota(&tx, target, quota, &now)?;
        }
        let _ = AccountRepo::record_success(&tx, target, false, &now)?;
        HealthRepo::reset_failures(&tx, target, &now)?;

        // A refresh that reports zero remaining quota parks the account
        // immediately rather than waiting for a failed send.
        if success.quota.as_ref().is_some_and(QuotaSnapshot::is_exhausted) {
            let _ = AccountRepo::record_failure(
                &tx,
                target,
                AccountStatus::QuotaExhausted,
                0,
                "quota_exhausted",
                "quota exhausted at refresh",
                success
                    .quota
                    .as_ref()
                    .and_then(|q| q.next_refresh_time.as_deref()),
                true,
                &now,
            )?;
        }

        self.append_audit_in_tx(
            &tx,
            &AuditEntry::new(
                Some(target),
                actor,
                "refresh_account",
                "ok",
                json!({ "merged_from": merged_from }),
            ),
            &now,
        );
        tx.commit()?;
        Ok(RefreshPersisted {
            account_id: target,
            merged_from,
        })
    }

    fn mark_decrypt_failed(&self, id: i64, err: &CryptoError) -> Result<()> {
        let update = FailureUpdate {
            status: AccountStatus::Disabled,
            cooldown_until: None,
            code: "decrypt_failed".into(),
            message: err.to_string(),
            zero_out_quota: false,
            bump_error_count: true,
        };
        let _ = self.record_failure(id, &update, Actor::Runtime, "decrypt_refresh_token")?;
        Ok(())
    }

    // ── Health snapshots ─────────────────────────────────────────────────

    /// Write the health snapshot for one account.
    pub fn snapshot_health(&self, snapshot: &HealthSnapshot) -> Result<()> {
        HealthRepo::upsert(&*self.conn()?, snapshot, &time::now_iso())
    }

    /// Read the health snapshot for one account.
    pub fn read_health(&self, id: i64) -> Result<Option<HealthSnapshot>> {
        HealthRepo::get(&*self.conn()?, id)
    }

    /// Read all health snapshots.
    pub fn list_health(&self) -> Result<Vec<HealthSnapshot>> {
        HealthRepo::list(&*self.conn()?)
    }

    // ── Audit ────────────────────────────────────────────────────────────

    /// Append a standalone audit event (outside any transition).
    pub fn append_audit(&self, entry: &AuditEntry) -> Result<i64> {
        AuditRepo::append(&*self.conn()?, entry, &time::now_iso())
    }

    /// Read the audit log, newest first.
    pub fn list_audit(&self, filter: &AuditFilter, limit: u32) -> Result<Vec<AuditEvent>> {
        AuditRepo::list(&*self.conn()?, filter, limit)
    }

    // Audit writes inside a transition are best-effort: losing the entry is
    // logged but never rolls back the transition itself.
    fn append_audit_in_tx(&self, conn: &rusqlite::Connection, entry: &AuditEntry, now: &str) {
        if let Err(err) = AuditRepo::append(conn, entry, now) {
            warn!(action = %entry.action, error = %err, "audit append failed");
        }
    }

    // ── Statistics / app state ───────────────────────────────────────────

    /// Counts grouped by status and health.
    pub fn statistics(&self) -> Result<PoolStatistics> {
        let conn = self.conn()?;
        let by_status_rows = AccountRepo::count_by_status(&conn)?;
        let total = by_status_rows.iter().map(|(_, c)| c).sum();
        let by_status = by_status_rows.into_iter().collect();
        let (healthy, unhealthy) = HealthRepo::counts(&conn)?;
        Ok(PoolStatistics {
            total,
            by_status,
            healthy,
            unhealthy,
            unchecked: total - healthy - unhealthy,
        })
    }

    /// Set an app-state key with optional TTL.
    pub fn kv_set(&self, key: &str, value: &[u8], ttl_seconds: Option<i64>) -> Result<()> {
        AppStateRepo::set(&*self.conn()?, key, value, ttl_seconds, &time::now_iso())
    }

    /// Get an app-state key (expired keys read as absent).
    pub fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        AppStateRepo::get(&*self.conn()?, key)
    }

    /// Delete an app-state key.
    pub fn kv_del(&self, key: &str) -> Result<()> {
        AppStateRepo::delete(&*self.conn()?, key)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
