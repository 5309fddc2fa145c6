//! Row structs returned by the repositories.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use warpflow_core::time;
use warpflow_core::{AccountStatus, Actor, QuotaSnapshot};

/// One upstream credential, as persisted.
///
/// The refresh token itself only exists as the sealed blob; callers go
/// through [`crate::AccountStore::refresh_token_plaintext`] to read it.
#[derive(Clone, Debug)]
pub struct Account {
    /// Stable row id; the unit of rotation.
    pub id: i64,
    /// Human label shown in the admin surface.
    pub label: Option<String>,
    /// Display-only email; not authoritative.
    pub email: Option<String>,
    /// SHA-256 hex fingerprint of the refresh token (unique).
    pub token_fingerprint: String,
    /// `nonce || ciphertext || tag` of the refresh token.
    pub refresh_token_sealed: Vec<u8>,
    /// Masked preview of the refresh token for display.
    pub token_preview: String,
    /// Last-known access token.
    pub access_token: Option<String>,
    /// RFC 3339 expiry of the access token.
    pub access_token_expires_at: Option<String>,
    /// Lifecycle state.
    pub status: AccountStatus,
    /// Successful dispatches served by this account.
    pub use_count: i64,
    /// Consecutive dispatch-level failures since the last success.
    pub error_count: i64,
    /// Machine-readable code of the last failure.
    pub last_error_code: Option<String>,
    /// Human-readable message of the last failure.
    pub last_error_message: Option<String>,
    /// RFC 3339 instant of the last successful use or refresh.
    pub last_success_at: Option<String>,
    /// RFC 3339 instant of the last time anything touched this account.
    pub last_check_at: Option<String>,
    /// RFC 3339 instant until which the account is cooling down.
    pub cooldown_until: Option<String>,
    /// Last-known quota, if any refresh has reported one.
    pub quota: Option<QuotaSnapshot>,
    /// RFC 3339 instant of the last quota report.
    pub quota_updated_at: Option<String>,
    /// RFC 3339 creation instant.
    pub created_at: String,
    /// RFC 3339 last-update instant.
    pub updated_at: String,
}

impl Account {
    /// Whether a cooldown window is still in effect at `now`.
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until
            .as_deref()
            .is_some_and(|cu| time::is_future(cu, now))
    }

    /// Whether the stored access token can still be presented upstream.
    ///
    /// Missing expiry means unusable — the dispatch path refreshes first.
    pub fn access_token_usable(&self, now: DateTime<Utc>) -> bool {
        if self.access_token.as_deref().map_or(true, str::is_empty) {
            return false;
        }
        self.access_token_expires_at
            .as_deref()
            .is_some_and(|exp| time::is_future(exp, now))
    }
}

/// Write side of one audit entry.
#[derive(Clone, Debug)]
pub struct AuditEntry {
    /// Affected account, if any.
    pub account_id: Option<i64>,
    /// Who acted.
    pub actor: Actor,
    /// Action name (e.g. `"dispatch_send"`, `"batch_import"`).
    pub action: String,
    /// Outcome tag (e.g. `"ok"`, `"failed"`, `"quota_exhausted"`).
    pub outcome: String,
    /// Structured detail payload.
    pub detail: Value,
}

impl AuditEntry {
    /// Convenience constructor.
    pub fn new(
        account_id: Option<i64>,
        actor: Actor,
        action: impl Into<String>,
        outcome: impl Into<String>,
        detail: Value,
    ) -> Self {
        Self {
            account_id,
            actor,
            action: action.into(),
            outcome: outcome.into(),
            detail,
        }
    }
}

/// One persisted audit event (append-only; never updated or deleted).
#[derive(Clone, Debug, Serialize)]
pub struct AuditEvent {
    /// Monotonic event id.
    pub id: i64,
    /// Affected account, if any.
    pub account_id: Option<i64>,
    /// Who acted.
    pub actor: String,
    /// Action name.
    pub action: String,
    /// Outcome tag.
    pub outcome: String,
    /// Structured detail payload.
    pub detail: Value,
    /// RFC 3339 instant the event was appended.
    pub created_at: String,
}

/// Filter for reading the audit log.
#[derive(Clone, Debug, Default)]
pub struct AuditFilter {
    /// Only events touching this account.
    pub account_id: Option<i64>,
    /// Only events with this action name.
    pub action: Option<String>,
}

/// Per-account health as observed by the monitor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Account this snapshot describes.
    pub account_id: i64,
    /// `None` until the first probe completes.
    pub healthy: Option<bool>,
    /// RFC 3339 instant of the last probe.
    pub last_checked_at: Option<String>,
    /// RFC 3339 instant of the last successful probe.
    pub last_success_at: Option<String>,
    /// Probe failures since the last success.
    pub consecutive_failures: i64,
    /// Wall-clock latency of the last probe.
    pub latency_ms: Option<i64>,
    /// Message from the last failed probe.
    pub last_error: Option<String>,
    /// RFC 3339 instant this row was written.
    pub updated_at: String,
}

/// One account to import.
#[derive(Clone, Debug, Deserialize)]
pub struct ImportSpec {
    /// The long-lived credential.
    pub refresh_token: String,
    /// Optional label; a unique `tk-<hex>` label is generated when absent.
    pub label: Option<String>,
    /// Optional display email.
    pub email: Option<String>,
}

/// Per-row outcome of a batch import.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ImportOutcome {
    /// A new account row was created.
    Inserted {
        /// Id of the new row.
        id: i64,
    },
    /// An account with the same fingerprint already exists.
    Duplicate {
        /// Id of the existing row.
        existing_id: i64,
    },
    /// The row could not be imported.
    Invalid {
        /// Why the row was rejected.
        reason: String,
    },
}

/// Aggregate result of a batch import.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ImportSummary {
    /// Rows inserted.
    pub inserted: u32,
    /// Rows skipped as fingerprint duplicates.
    pub duplicates: u32,
    /// Rows rejected as invalid.
    pub errors: u32,
    /// Per-row outcomes, keyed by masked preview.
    pub rows: Vec<(String, ImportOutcome)>,
}

/// Counts grouped over the pool.
#[derive(Clone, Debug, Serialize)]
pub struct PoolStatistics {
    /// All accounts.
    pub total: i64,
    /// Accounts per status string.
    pub by_status: BTreeMap<String, i64>,
    /// Accounts whose last probe succeeded.
    pub healthy: i64,
    /// Accounts whose last probe failed.
    pub unhealthy: i64,
    /// Accounts never probed.
    pub unchecked: i64,
}

/// Result of persisting a successful refresh.
#[derive(Clone, Debug)]
pub struct RefreshPersisted {
    /// Account the result was applied to.
    pub account_id: i64,
    /// When the rotated refresh token collided with another account, the
    /// source row that was merged away.
    pub merged_from: Option<i64>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
