//! Refresh coordination: exchange + quota probe + persistence.
//!
//! The identity exchange itself is pure HTTP; this coordinator decrypts
//! the stored refresh token, runs the exchange, probes quota on success,
//! and writes the classified outcome back through the store — one place
//! that knows how refresh results become account state.
//!
//! Callers must hold the account's exclusivity lock.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{instrument, warn};

use warpflow_auth::{QuotaProbe, RefreshOutcome, Refresher};
use warpflow_core::{time, AccountStatus, Actor, QuotaSnapshot};
use warpflow_store::{
    Account, AccountStore, FailureUpdate, RefreshSuccess, Result as StoreResult, StoreError,
};

/// Exchange-and-probe boundary, mockable for pipeline tests.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    /// Exchange a refresh token (with retries) for an access token.
    async fn exchange(&self, refresh_token: &str) -> RefreshOutcome;

    /// Best-effort quota probe with a fresh access token.
    async fn fetch_quota(&self, access_token: &str) -> Option<QuotaSnapshot>;
}

/// Production exchanger: the identity-provider refresher plus the quota
/// probe, sharing one HTTP client.
pub struct IdentityExchanger {
    refresher: Refresher,
    quota: QuotaProbe,
}

impl IdentityExchanger {
    /// Bundle the two HTTP services.
    pub fn new(refresher: Refresher, quota: QuotaProbe) -> Self {
        Self { refresher, quota }
    }
}

#[async_trait]
impl TokenExchanger for IdentityExchanger {
    async fn exchange(&self, refresh_token: &str) -> RefreshOutcome {
        self.refresher.refresh(refresh_token).await
    }

    async fn fetch_quota(&self, access_token: &str) -> Option<QuotaSnapshot> {
        match self.quota.fetch(access_token).await {
            Ok(q) => Some(q),
            Err(err) => {
                warn!(error = %err, "quota probe failed after refresh");
                None
            }
        }
    }
}

/// Cooldown policy applied to refresh failures.
#[derive(Clone, Copy, Debug)]
pub struct RefreshPolicy {
    /// Long cooldown after quota exhaustion, in seconds.
    pub quota_cooldown_seconds: i64,
}

/// Result of one coordinated refresh.
#[derive(Clone, Debug)]
pub enum RefreshResult {
    /// The account, re-read with its fresh access token. May be a
    /// different row than the input when a rotated token merged accounts.
    Ok(Account),
    /// The refresh failed; the transition is already persisted.
    Failed {
        /// Audit code of the failure.
        code: String,
        /// Human-readable message.
        message: String,
        /// Whether the account is now terminally ineligible.
        terminal: bool,
    },
}

/// Runs refreshes and persists their outcomes. Cheap to clone.
#[derive(Clone)]
pub struct RefreshCoordinator {
    store: Arc<AccountStore>,
    exchanger: Arc<dyn TokenExchanger>,
    policy: RefreshPolicy,
}

impl RefreshCoordinator {
    /// Create a coordinator over the shared store and exchange boundary.
    pub fn new(
        store: Arc<AccountStore>,
        exchanger: Arc<dyn TokenExchanger>,
        policy: RefreshPolicy,
    ) -> Self {
        Self {
            store,
            exchanger,
            policy,
        }
    }

    /// Refresh `account`'s access token and persist the outcome.
    #[instrument(skip_all, fields(account_id = account.id))]
    pub async fn refresh_account(
        &self,
        account: &Account,
        actor: Actor,
    ) -> StoreResult<RefreshResult> {
        let refresh_token = match self.store.refresh_token_plaintext(account) {
            Ok(token) => token,
            Err(StoreError::Crypto(err)) => {
                // The account is already disabled and audited; the pool
                // moves on without it.
                return Ok(RefreshResult::Failed {
                    code: "decrypt_failed".into(),
                    message: err.to_string(),
                    terminal: true,
                });
            }
            Err(err) => return Err(err),
        };

        match self.exchanger.exchange(&refresh_token).await {
            RefreshOutcome::Ok(grant) => {
                let quota = self.exchanger.fetch_quota(&grant.access_token).await;
                let persisted = self.store.record_refresh_success(
                    account.id,
                    &RefreshSuccess {
                        rotated_refresh_token: grant.refresh_token,
                        access_token: grant.access_token,
                        expires_at: grant.expires_at,
                        quota,
                    },
                    actor,
                )?;
                Ok(RefreshResult::Ok(self.store.require(persisted.account_id)?))
            }
            outcome => {
                let (update, terminal) = self.failure_update(account, &outcome);
                let message = update.message.clone();
                let code = update.code.clone();
                let _ = self
                    .store
                    .record_failure(account.id, &update, actor, "refresh_account")?;
                Ok(RefreshResult::Failed {
                    code,
                    message,
                    terminal,
                })
            }
        }
    }

    /// Map a failed refresh outcome onto its state transition.
    fn failure_update(&self, account: &Account, outcome: &RefreshOutcome) -> (FailureUpdate, bool) {
        match outcome {
            RefreshOutcome::Ok(_) => unreachable!("success handled by caller"),
            RefreshOutcome::Rejected { code, message } => (
                FailureUpdate {
                    status: AccountStatus::Blocked,
                    cooldown_until: None,
                    code: code.clone(),
                    message: message.clone(),
                    zero_out_quota: false,
                    bump_error_count: true,
                },
                true,
            ),
            RefreshOutcome::Transient { code, message } => (
                FailureUpdate {
                    // Transient provider trouble keeps the current status.
                    status: account.status,
                    cooldown_until: None,
                    code: code.clone(),
                    message: message.clone(),
                    zero_out_quota: false,
                    bump_error_count: true,
                },
                false,
            ),
            RefreshOutcome::Network { message } => (
                FailureUpdate {
                    status: account.status,
                    cooldown_until: None,
                    code: "network".into(),
                    message: message.clone(),
                    zero_out_quota: false,
                    bump_error_count: true,
                },
                false,
            ),
            RefreshOutcome::QuotaExhausted { message } => (
                FailureUpdate {
                    status: AccountStatus::QuotaExhausted,
                    cooldown_until: Some(time::future_iso(self.policy.quota_cooldown_seconds)),
                    code: "quota_exhausted".into(),
                    message: message.clone(),
                    zero_out_quota: true,
                    bump_error_count: true,
                },
                false,
            ),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use warpflow_auth::TokenGrant;
    use warpflow_store::{CryptoBox, ImportOutcome, ImportSpec};

    /// Scripted exchanger for tests.
    struct ScriptedExchanger {
        outcome: RefreshOutcome,
        quota: Option<QuotaSnapshot>,
    }

    #[async_trait]
    impl TokenExchanger for ScriptedExchanger {
        async fn exchange(&self, _refresh_token: &str) -> RefreshOutcome {
            self.outcome.clone()
        }

        async fn fetch_quota(&self, _access_token: &str) -> Option<QuotaSnapshot> {
            self.quota.clone()
        }
    }

    fn store() -> Arc<AccountStore> {
        Arc::new(AccountStore::open_in_memory(CryptoBox::from_key_bytes(&[3u8; 32])).unwrap())
    }

    fn import(store: &AccountStore, token: &str) -> Account {
        let id = match store
            .insert(
                &ImportSpec {
                    refresh_token: token.into(),
                    label: None,
                    email: None,
                },
                Actor::Admin,
            )
            .unwrap()
        {
            ImportOutcome::Inserted { id } => id,
            other => panic!("unexpected {other:?}"),
        };
        store.require(id).unwrap()
    }

    fn coordinator(
        store: &Arc<AccountStore>,
        outcome: RefreshOutcome,
        quota: Option<QuotaSnapshot>,
    ) -> RefreshCoordinator {
        RefreshCoordinator::new(
            Arc::clone(store),
            Arc::new(ScriptedExchanger { outcome, quota }),
            RefreshPolicy {
                quota_cooldown_seconds: 3600,
            },
        )
    }

    fn ok_grant() -> RefreshOutcome {
        RefreshOutcome::Ok(TokenGrant {
            access_token: "jwt-fresh".into(),
            refresh_token: None,
            expires_at: time::future_iso(3600),
        })
    }

    #[tokio::test]
    async fn success_persists_token_and_quota() {
        let s = store();
        let account = import(&s, "1//0tok");
        let coord = coordinator(
            &s,
            ok_grant(),
            Some(QuotaSnapshot::from_report(100, 5, false, None, None)),
        );

        match coord.refresh_account(&account, Actor::Runtime).await.unwrap() {
            RefreshResult::Ok(updated) => {
                assert_eq!(updated.access_token.as_deref(), Some("jwt-fresh"));
                assert_eq!(updated.quota.unwrap().remaining, 95);
                assert_eq!(updated.status, AccountStatus::Active);
                assert_eq!(updated.error_count, 0);
            }
            other => panic!("expected ok, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_refresh_blocks_account() {
        let s = store();
        let account = import(&s, "1//0tok");
        let coord = coordinator(
            &s,
            RefreshOutcome::Rejected {
                code: "invalid_grant".into(),
                message: "INVALID_GRANT".into(),
            },
            None,
        );

        match coord.refresh_account(&account, Actor::Runtime).await.unwrap() {
            RefreshResult::Failed { terminal, code, .. } => {
                assert!(terminal);
                assert_eq!(code, "invalid_grant");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        let after = s.require(account.id).unwrap();
        assert_eq!(after.status, AccountStatus::Blocked);
        assert_eq!(after.error_count, 1);
        assert!(after.cooldown_until.is_none());
    }

    #[tokio::test]
    async fn transient_refresh_keeps_status() {
        let s = store();
        let account = import(&s, "1//0tok");
        let coord = coordinator(
            &s,
            RefreshOutcome::Transient {
                code: "http_503".into(),
                message: "overloaded".into(),
            },
            None,
        );

        let result = coord.refresh_account(&account, Actor::Runtime).await.unwrap();
        assert!(matches!(result, RefreshResult::Failed { terminal: false, .. }));
        let after = s.require(account.id).unwrap();
        assert_eq!(after.status, AccountStatus::Active, "status unchanged");
        assert_eq!(after.error_count, 1);
    }

    #[tokio::test]
    async fn quota_outcome_parks_with_long_cooldown() {
        let s = store();
        let account = import(&s, "1//0tok");
        let coord = coordinator(
            &s,
            RefreshOutcome::QuotaExhausted {
                message: "No remaining quota".into(),
            },
            None,
        );

        let _ = coord.refresh_account(&account, Actor::Runtime).await.unwrap();
        let after = s.require(account.id).unwrap();
        assert_eq!(after.status, AccountStatus::QuotaExhausted);
        let seconds =
            time::seconds_until(after.cooldown_until.as_deref().unwrap(), chrono::Utc::now());
        assert!((3597..=3600).contains(&seconds), "got {seconds}");
    }

    #[tokio::test]
    async fn exhausted_quota_at_refresh_parks_account() {
        let s = store();
        let account = import(&s, "1//0tok");
        let coord = coordinator(
            &s,
            ok_grant(),
            Some(QuotaSnapshot::from_report(100, 100, false, None, None)),
        );

        match coord.refresh_account(&account, Actor::Runtime).await.unwrap() {
            RefreshResult::Ok(updated) => {
                assert_eq!(updated.status, AccountStatus::QuotaExhausted);
            }
            other => panic!("expected ok, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn corrupted_record_fails_terminally() {
        let s = store();
        let account = import(&s, "1//0tok");
        // Corrupt the ciphertext under a different key.
        let mut corrupted = account.clone();
        corrupted.refresh_token_sealed = vec![0u8; 40];
        let coord = coordinator(&s, ok_grant(), None);

        match coord
            .refresh_account(&corrupted, Actor::Runtime)
            .await
            .unwrap()
        {
            RefreshResult::Failed { code, terminal, .. } => {
                assert_eq!(code, "decrypt_failed");
                assert!(terminal);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(s.require(account.id).unwrap().status, AccountStatus::Disabled);
    }
}
