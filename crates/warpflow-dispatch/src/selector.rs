//! Account selection.
//!
//! Filters the pool down to eligible accounts, ranks them, and returns
//! the first one whose exclusivity lock can be taken without blocking.
//! When every eligible account is busy, waits a bounded time for any one
//! lock to free.
//!
//! Ranking: fewer errors first, then oldest success first (round-robin
//! pressure), then lowest use count, then id. A rotation cursor in the
//! app-state KV starts each scan after the previously dispatched account
//! so equally ranked accounts take turns across dispatches.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use warpflow_core::time;
use warpflow_core::AccountStatus;
use warpflow_store::{Account, AccountStore, HealthSnapshot, Result as StoreResult};

use crate::locks::{AccountGuard, AccountLocks};

/// KV key remembering the last account a dispatch selected.
const CURSOR_KEY: &str = "scheduler.last_account_id";

/// Selector tunables.
#[derive(Clone, Debug)]
pub struct SelectorConfig {
    /// Consecutive probe failures that make an account ineligible.
    pub health_fail_threshold: i64,
    /// How long to wait for a busy pool before reporting unavailable.
    pub lock_wait: Duration,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            health_fail_threshold: 3,
            lock_wait: Duration::from_secs(5),
        }
    }
}

/// Chooses an eligible account and takes its lock.
pub struct AccountSelector {
    store: Arc<AccountStore>,
    locks: Arc<AccountLocks>,
    config: SelectorConfig,
}

impl AccountSelector {
    /// Create a selector over the shared store and lock registry.
    pub fn new(store: Arc<AccountStore>, locks: Arc<AccountLocks>, config: SelectorConfig) -> Self {
        Self {
            store,
            locks,
            config,
        }
    }

    /// Pick an account not in `exclude`, lock held. `None` when nothing is
    /// eligible or everything stayed busy past the wait budget.
    pub async fn select(
        &self,
        exclude: &HashSet<i64>,
    ) -> StoreResult<Option<(Account, AccountGuard)>> {
        let candidates = self.candidates(exclude)?;
        if candidates.is_empty() {
            return Ok(None);
        }

        // Fast path: first candidate whose lock is free right now.
        for account in &candidates {
            if let Some(guard) = self.locks.try_acquire(account.id) {
                self.remember_cursor(account.id);
                return Ok(Some((account.clone(), guard)));
            }
        }

        // Everything eligible is mid-send; wait for any lock to free.
        debug!(
            candidates = candidates.len(),
            "all eligible accounts busy, waiting"
        );
        let waiters = candidates
            .iter()
            .map(|account| {
                let locks = Arc::clone(&self.locks);
                let id = account.id;
                Box::pin(async move { (id, locks.acquire(id).await) })
            })
            .collect::<Vec<_>>();

        let winner = tokio::time::timeout(
            self.config.lock_wait,
            futures::future::select_all(waiters),
        )
        .await;

        let Ok(((id, guard), _, _)) = winner else {
            return Ok(None);
        };

        // The account may have transitioned while we waited; re-check.
        let Some(account) = self.store.get(id)? else {
            return Ok(None);
        };
        if self.is_eligible(&account, exclude, Utc::now())? {
            self.remember_cursor(account.id);
            return Ok(Some((account, guard)));
        }
        Ok(None)
    }

    /// Eligible accounts in selection order.
    fn candidates(&self, exclude: &HashSet<i64>) -> StoreResult<Vec<Account>> {
        let now = Utc::now();
        let health: Vec<HealthSnapshot> = self.store.list_health()?;
        let failures_of = |id: i64| {
            health
                .iter()
                .find(|h| h.account_id == id)
                .map_or(0, |h| h.consecutive_failures)
        };

        let mut candidates: Vec<Account> = self
            .store
            .list()?
            .into_iter()
            .filter(|a| {
                a.status == AccountStatus::Active
                    && !exclude.contains(&a.id)
                    && !a.in_cooldown(now)
                    && failures_of(a.id) < self.config.health_fail_threshold
                    && !a.refresh_token_sealed.is_empty()
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.error_count
                .cmp(&b.error_count)
                .then_with(|| success_ts(a).cmp(&success_ts(b)))
                .then_with(|| a.use_count.cmp(&b.use_count))
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(self.rotate_after_cursor(candidates))
    }

    fn is_eligible(
        &self,
        account: &Account,
        exclude: &HashSet<i64>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let failures = self
            .store
            .read_health(account.id)?
            .map_or(0, |h| h.consecutive_failures);
        Ok(account.status == AccountStatus::Active
            && !exclude.contains(&account.id)
            && !account.in_cooldown(now)
            && failures < self.config.health_fail_threshold)
    }

    /// Start the ring just after the last dispatched account.
    fn rotate_after_cursor(&self, candidates: Vec<Account>) -> Vec<Account> {
        let Some(last_id) = self
            .store
            .kv_get(CURSOR_KEY)
            .ok()
            .flatten()
            .and_then(|v| String::from_utf8(v).ok())
            .and_then(|s| s.parse::<i64>().ok())
        else {
            return candidates;
        };
        let Some(pos) = candidates.iter().position(|a| a.id == last_id) else {
            return candidates;
        };
        let mut rotated = candidates;
        let len = rotated.len();
        rotated.rotate_left((pos + 1) % len);
        rotated
    }

    // Losing the cursor only costs a little fairness.
    fn remember_cursor(&self, id: i64) {
        let _ = self.store.kv_set(CURSOR_KEY, id.to_string().as_bytes(), None);
    }
}

/// Sort key for `last_success_at`: never-used accounts sort oldest.
fn success_ts(account: &Account) -> i64 {
    account
        .last_success_at
        .as_deref()
        .and_then(time::parse_iso)
        .map_or(0, |dt| dt.timestamp())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
