//! Readiness projection.
//!
//! A pure fold over the account list answering "can the pool serve
//! traffic right now", plus the soonest instant at which an unavailable
//! pool is expected to recover.

use chrono::{DateTime, Utc};
use serde::Serialize;

use warpflow_core::time;
use warpflow_core::AccountStatus;
use warpflow_store::Account;

/// Aggregate pool readiness.
#[derive(Clone, Debug, Serialize)]
pub struct Readiness {
    /// `available > 0`.
    pub ready: bool,
    /// All accounts.
    pub total: i64,
    /// Active accounts with no cooldown in effect.
    pub available: i64,
    /// Accounts cooling down (by status or by a live cooldown window).
    pub cooldown: i64,
    /// Blocked accounts.
    pub blocked: i64,
    /// Quota-exhausted accounts.
    pub quota_exhausted: i64,
    /// Operator-disabled accounts.
    pub disabled: i64,
    /// RFC 3339 instant of the soonest expected recovery, if any.
    pub next_recovery_at: Option<String>,
}

/// Project readiness from an account snapshot.
pub fn readiness(accounts: &[Account], now: DateTime<Utc>) -> Readiness {
    let mut out = Readiness {
        ready: false,
        total: accounts.len() as i64,
        available: 0,
        cooldown: 0,
        blocked: 0,
        quota_exhausted: 0,
        disabled: 0,
        next_recovery_at: None,
    };
    let mut soonest: Option<DateTime<Utc>> = None;
    let mut consider = |instant: Option<&str>| {
        let Some(dt) = instant.and_then(time::parse_iso).filter(|dt| *dt > now) else {
            return;
        };
        if soonest.is_none_or(|s| dt < s) {
            soonest = Some(dt);
        }
    };

    for account in accounts {
        match account.status {
            AccountStatus::Active => {
                if account.in_cooldown(now) {
                    out.cooldown += 1;
                    consider(account.cooldown_until.as_deref());
                } else {
                    out.available += 1;
                }
            }
            AccountStatus::Cooldown => {
                out.cooldown += 1;
                consider(account.cooldown_until.as_deref());
            }
            AccountStatus::Blocked => out.blocked += 1,
            AccountStatus::QuotaExhausted => {
                out.quota_exhausted += 1;
                consider(account.cooldown_until.as_deref());
                consider(
                    account
                        .quota
                        .as_ref()
                        .and_then(|q| q.next_refresh_time.as_deref()),
                );
            }
            AccountStatus::Disabled => out.disabled += 1,
        }
    }

    out.ready = out.available > 0;
    out.next_recovery_at = soonest.map(|dt| dt.to_rfc3339());
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
