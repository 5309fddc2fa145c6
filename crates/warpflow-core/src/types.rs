//! Account lifecycle and quota types shared across crates.

use serde::{Deserialize, Serialize};

/// Lifecycle state of one upstream account.
///
/// `Disabled` is operator-only: nothing in the runtime ever enters or
/// leaves it automatically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// Eligible for traffic (subject to cooldown and health checks).
    Active,
    /// Temporarily ineligible; recovers when `cooldown_until` passes.
    Cooldown,
    /// Persistently rejected by the identity provider; needs operator action.
    Blocked,
    /// Out of upstream request quota until the next refresh window.
    QuotaExhausted,
    /// Explicitly parked by an operator.
    Disabled,
}

impl AccountStatus {
    /// Stable string form used in the database and API payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cooldown => "cooldown",
            Self::Blocked => "blocked",
            Self::QuotaExhausted => "quota_exhausted",
            Self::Disabled => "disabled",
        }
    }

    /// Parse the database/API string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "cooldown" => Some(Self::Cooldown),
            "blocked" => Some(Self::Blocked),
            "quota_exhausted" => Some(Self::QuotaExhausted),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who performed an auditable action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    /// Operator via the admin surface.
    Admin,
    /// The dispatch pipeline.
    Runtime,
    /// The background health monitor.
    Monitor,
}

impl Actor {
    /// Stable string form used in the audit log.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Runtime => "runtime",
            Self::Monitor => "monitor",
        }
    }
}

/// Last-known upstream quota for one account.
///
/// `is_unlimited` overrides the numeric fields: an unlimited account is
/// normalized to `limit = -1, used = 0, remaining = -1` at the point the
/// snapshot is taken, so consumers never compare stale counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    /// Request limit for the current window (`-1` when unlimited).
    pub limit: i64,
    /// Requests consumed in the current window.
    pub used: i64,
    /// Requests left (`-1` when unlimited).
    pub remaining: i64,
    /// Whether the account has no request limit.
    pub is_unlimited: bool,
    /// RFC 3339 instant when the window resets, if reported.
    pub next_refresh_time: Option<String>,
    /// Window length reported by upstream (e.g. `"WEEKLY"`).
    pub refresh_duration: Option<String>,
}

impl QuotaSnapshot {
    /// Whether the snapshot shows no remaining requests.
    ///
    /// Unlimited accounts are never exhausted regardless of counters.
    pub fn is_exhausted(&self) -> bool {
        if self.is_unlimited {
            return false;
        }
        self.limit >= 0 && self.remaining <= 0
    }

    /// Normalize an upstream report into a snapshot.
    pub fn from_report(
        limit: i64,
        used: i64,
        is_unlimited: bool,
        next_refresh_time: Option<String>,
        refresh_duration: Option<String>,
    ) -> Self {
        if is_unlimited {
            return Self {
                limit: -1,
                used: 0,
                remaining: -1,
                is_unlimited: true,
                next_refresh_time,
                refresh_duration,
            };
        }
        Self {
            limit,
            used,
            remaining: limit - used,
            is_unlimited: false,
            next_refresh_time,
            refresh_duration,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [
            AccountStatus::Active,
            AccountStatus::Cooldown,
            AccountStatus::Blocked,
            AccountStatus::QuotaExhausted,
            AccountStatus::Disabled,
        ] {
            assert_eq!(AccountStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn status_parse_rejects_unknown() {
        assert_eq!(AccountStatus::parse("idle"), None);
        assert_eq!(AccountStatus::parse(""), None);
    }

    #[test]
    fn status_serde_uses_snake_case() {
        let json = serde_json::to_string(&AccountStatus::QuotaExhausted).unwrap();
        assert_eq!(json, "\"quota_exhausted\"");
    }

    #[test]
    fn quota_exhausted_when_remaining_zero() {
        let q = QuotaSnapshot::from_report(100, 100, false, None, None);
        assert!(q.is_exhausted());
        assert_eq!(q.remaining, 0);
    }

    #[test]
    fn quota_not_exhausted_with_headroom() {
        let q = QuotaSnapshot::from_report(100, 40, false, None, None);
        assert!(!q.is_exhausted());
        assert_eq!(q.remaining, 60);
    }

    #[test]
    fn unlimited_overrides_counters() {
        let q = QuotaSnapshot::from_report(100, 150, true, None, None);
        assert!(!q.is_exhausted());
        assert_eq!(q.limit, -1);
        assert_eq!(q.used, 0);
        assert_eq!(q.remaining, -1);
    }

    #[test]
    fn actor_strings() {
        assert_eq!(Actor::Admin.as_str(), "admin");
        assert_eq!(Actor::Runtime.as_str(), "runtime");
        assert_eq!(Actor::Monitor.as_str(), "monitor");
    }
}
