//! The dispatch pipeline.
//!
//! `dispatch()` runs the full account rotation for one client request:
//! select → lock → refresh-if-needed → send → classify → transition →
//! next account, within the per-request account budget. Classification is
//! two-phase for streams: the HTTP status and first event decide the
//! attempt outcome; a later in-band error updates counters but never
//! retries (the client already has bytes).
//!
//! This is the single-flight channel: every upstream request in the
//! process originates here.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use metrics::counter;
use tokio_stream::StreamExt;
use tracing::{debug, instrument, warn};

use warpflow_auth::jwt;
use warpflow_core::{time, AccountStatus, Actor, Config, GatewayError, GatewayResult};
use warpflow_store::{Account, AccountStore, FailureUpdate};
use warpflow_transport::{EventStream, TransportError, UpstreamTransport, WarpEvent};

use crate::classifier::{classify, classify_error_event, AttemptFailure, Outcome};
use crate::locks::AccountGuard;
use crate::readiness::readiness;
use crate::refresh::{RefreshCoordinator, RefreshResult};
use crate::selector::AccountSelector;

/// Dispatch requests started (counter).
const DISPATCH_REQUESTS_TOTAL: &str = "dispatch_requests_total";
/// Per-account attempts (counter, labels: outcome).
const DISPATCH_ATTEMPTS_TOTAL: &str = "dispatch_attempts_total";
/// Requests that found no ready account (counter).
const DISPATCH_UNAVAILABLE_TOTAL: &str = "dispatch_unavailable_total";

/// The one path to upstream, mockable for pipeline tests.
#[async_trait]
pub trait SendChannel: Send + Sync {
    /// Issue one streaming request bearing `access_token`.
    async fn send(
        &self,
        access_token: &str,
        request: Bytes,
    ) -> Result<EventStream, TransportError>;
}

#[async_trait]
impl SendChannel for UpstreamTransport {
    async fn send(
        &self,
        access_token: &str,
        request: Bytes,
    ) -> Result<EventStream, TransportError> {
        UpstreamTransport::send(self, access_token, request).await
    }
}

/// Dispatch tunables.
#[derive(Clone, Debug)]
pub struct DispatchPolicy {
    /// Distinct accounts tried per request.
    pub max_accounts_per_request: u32,
    /// Error count at which repeated soft failures earn a cooldown.
    pub failure_threshold: i64,
    /// Short cooldown in seconds.
    pub cooldown_seconds: i64,
    /// Long (quota) cooldown in seconds.
    pub quota_cooldown_seconds: i64,
    /// Transport retries within one account attempt.
    pub upstream_retry_count: u32,
    /// Linear backoff base between transport retries.
    pub upstream_retry_base_delay: Duration,
}

impl DispatchPolicy {
    /// Build from the gateway configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_accounts_per_request: config.max_accounts_per_request.max(1),
            failure_threshold: i64::from(config.failure_threshold.max(1)),
            cooldown_seconds: config.cooldown_seconds,
            quota_cooldown_seconds: config.quota_cooldown_seconds,
            upstream_retry_count: config.upstream_retry_count.max(1),
            upstream_retry_base_delay: Duration::from_millis(config.upstream_retry_base_delay_ms),
        }
    }
}

/// How one account attempt ended (when it did not produce a stream).
enum AttemptFailureKind {
    /// The credential could not be refreshed (or re-expired immediately).
    Refresh,
    /// Terminal upstream rejection for this account.
    Rejected,
    /// Network trouble, upstream 5xx, rate limit, or exhausted quota —
    /// the kind of failure a later retry may not hit.
    Unreachable,
}

enum AttemptResult {
    Stream(EventStream),
    Failed {
        kind: AttemptFailureKind,
        detail: String,
    },
}

/// Orchestrates account rotation for client requests.
pub struct Dispatcher {
    store: Arc<AccountStore>,
    selector: AccountSelector,
    refresh: RefreshCoordinator,
    channel: Arc<dyn SendChannel>,
    policy: DispatchPolicy,
}

impl Dispatcher {
    /// Wire up the pipeline.
    pub fn new(
        store: Arc<AccountStore>,
        selector: AccountSelector,
        refresh: RefreshCoordinator,
        channel: Arc<dyn SendChannel>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            store,
            selector,
            refresh,
            channel,
            policy,
        }
    }

    /// Serve one client request, rotating across eligible accounts.
    ///
    /// Returns the event stream on the first successful attempt. When the
    /// budget is exhausted (or no account is eligible), the aggregate
    /// error describes what the tried accounts ran into.
    #[instrument(skip_all, fields(bytes = request.len()))]
    pub async fn dispatch(&self, request: Bytes) -> GatewayResult<EventStream> {
        counter!(DISPATCH_REQUESTS_TOTAL).increment(1);

        let mut tried: HashSet<i64> = HashSet::new();
        let mut refresh_failures = 0usize;
        let mut rejections = 0usize;
        let mut unreachable = 0usize;
        let mut last_detail = String::new();

        while (tried.len() as u32) < self.policy.max_accounts_per_request {
            let Some((account, guard)) = self
                .selector
                .select(&tried)
                .await
                .map_err(internal)?
            else {
                break;
            };
            let _ = tried.insert(account.id);

            match self.attempt(account, guard, request.clone()).await? {
                AttemptResult::Stream(stream) => return Ok(stream),
                AttemptResult::Failed { kind, detail } => {
                    last_detail = detail;
                    match kind {
                        AttemptFailureKind::Refresh => refresh_failures += 1,
                        AttemptFailureKind::Rejected => rejections += 1,
                        AttemptFailureKind::Unreachable => unreachable += 1,
                    }
                }
            }
        }

        let attempts = tried.len();
        if attempts == 0 {
            counter!(DISPATCH_UNAVAILABLE_TOTAL).increment(1);
            let accounts = self.store.list().map_err(internal)?;
            let snapshot = readiness(&accounts, Utc::now());
            return Err(GatewayError::Unavailable {
                next_recovery_at: snapshot.next_recovery_at,
            });
        }

        debug!(
            attempts,
            refresh_failures, rejections, unreachable, "dispatch budget exhausted"
        );
        // Aggregate mapping: all-refresh failures are an auth problem;
        // any connectivity-flavored failure invites a client retry (503);
        // otherwise the request was rejected outright.
        Err(if refresh_failures == attempts {
            GatewayError::AuthFailed {
                detail: last_detail,
            }
        } else if unreachable > 0 {
            GatewayError::UpstreamUnreachable {
                detail: last_detail,
            }
        } else {
            GatewayError::UpstreamRejected {
                detail: last_detail,
            }
        })
    }

    /// Run one account attempt end to end. The guard is either moved into
    /// the returned stream or dropped on failure (releasing the lock).
    async fn attempt(
        &self,
        account: Account,
        guard: AccountGuard,
        request: Bytes,
    ) -> GatewayResult<AttemptResult> {
        let mut account = account;

        // Phase 0: make sure we hold a presentable access token.
        if !account.access_token_usable(Utc::now()) {
            match self
                .refresh
                .refresh_account(&account, Actor::Runtime)
                .await
                .map_err(internal)?
            {
                RefreshResult::Ok(updated) => account = updated,
                RefreshResult::Failed { message, .. } => {
                    counter!(DISPATCH_ATTEMPTS_TOTAL, "outcome" => "refresh_failed").increment(1);
                    return Ok(AttemptResult::Failed {
                        kind: AttemptFailureKind::Refresh,
                        detail: message,
                    });
                }
            }
            if account.status != AccountStatus::Active || !account.access_token_usable(Utc::now())
            {
                counter!(DISPATCH_ATTEMPTS_TOTAL, "outcome" => "refresh_failed").increment(1);
                return Ok(AttemptResult::Failed {
                    kind: AttemptFailureKind::Refresh,
                    detail: format!(
                        "account unusable after refresh (status {})",
                        account.status
                    ),
                });
            }
        }

        let mut access = account
            .access_token
            .clone()
            .ok_or_else(|| internal_msg("usable account without access token"))?;

        let mut auth_retried = false;
        let mut transport_try = 1u32;

        loop {
            match self.channel.send(&access, request.clone()).await {
                Ok(mut stream) => match stream.next().await {
                    Some(WarpEvent::Error { message }) => {
                        // 200 but the very first frame is an error: the
                        // client has seen nothing, so classify and rotate.
                        let outcome = classify_error_event(&message);
                        counter!(DISPATCH_ATTEMPTS_TOTAL, "outcome" => outcome.code())
                            .increment(1);
                        self.apply_failure(&account, &outcome, &message)
                            .map_err(internal)?;
                        return Ok(AttemptResult::Failed {
                            kind: bucket(&outcome),
                            detail: message,
                        });
                    }
                    Some(first) => {
                        counter!(DISPATCH_ATTEMPTS_TOTAL, "outcome" => "ok").increment(1);
                        let _ = self
                            .store
                            .record_success(account.id, true, Actor::Runtime, "dispatch_send")
                            .map_err(internal)?;
                        return Ok(AttemptResult::Stream(self.wrap_stream(
                            first,
                            stream,
                            guard,
                            account.id,
                        )));
                    }
                    None => {
                        let message = "stream ended before any event".to_string();
                        counter!(DISPATCH_ATTEMPTS_TOTAL, "outcome" => "unknown").increment(1);
                        self.apply_failure(&account, &Outcome::Unknown, &message)
                            .map_err(internal)?;
                        return Ok(AttemptResult::Failed {
                            kind: AttemptFailureKind::Rejected,
                            detail: message,
                        });
                    }
                },
                Err(err) => {
                    let observed = observe(&err, &access);
                    let outcome = classify(&observed.failure());
                    match outcome {
                        Outcome::AuthExpired if !auth_retried => {
                            // Refresh and retry the same account once.
                            auth_retried = true;
                            match self
                                .refresh
                                .refresh_account(&account, Actor::Runtime)
                                .await
                                .map_err(internal)?
                            {
                                RefreshResult::Ok(updated)
                                    if updated.status == AccountStatus::Active
                                        && updated.access_token.is_some() =>
                                {
                                    account = updated;
                                    access = account
                                        .access_token
                                        .clone()
                                        .unwrap_or_default();
                                    continue;
                                }
                                RefreshResult::Ok(updated) => {
                                    return Ok(AttemptResult::Failed {
                                        kind: AttemptFailureKind::Refresh,
                                        detail: format!(
                                            "account unusable after refresh (status {})",
                                            updated.status
                                        ),
                                    });
                                }
                                RefreshResult::Failed { message, .. } => {
                                    counter!(DISPATCH_ATTEMPTS_TOTAL, "outcome" => "refresh_failed")
                                        .increment(1);
                                    return Ok(AttemptResult::Failed {
                                        kind: AttemptFailureKind::Refresh,
                                        detail: message,
                                    });
                                }
                            }
                        }
                        Outcome::Network | Outcome::ServerError
                            if transport_try < self.policy.upstream_retry_count =>
                        {
                            // Transient transport trouble: retry this
                            // account before burning the rotation budget.
                            let delay = self.policy.upstream_retry_base_delay * transport_try;
                            transport_try += 1;
                            debug!(account_id = account.id, ?delay, "transport retry");
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        outcome => {
                            counter!(DISPATCH_ATTEMPTS_TOTAL, "outcome" => outcome.code())
                                .increment(1);
                            let detail = observed.detail();
                            self.apply_failure(&account, &outcome, &detail)
                                .map_err(internal)?;
                            return Ok(AttemptResult::Failed {
                                kind: bucket(&outcome),
                                detail,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Persist the transition an outcome demands for `account`.
    fn apply_failure(
        &self,
        account: &Account,
        outcome: &Outcome,
        message: &str,
    ) -> warpflow_store::Result<()> {
        let update = failure_update(&self.policy, account, outcome, message);
        let _ = self
            .store
            .record_failure(account.id, &update, Actor::Runtime, "dispatch_send")?;
        Ok(())
    }

    /// Wrap the already-started stream: hold the account lock for its
    /// life, and translate a mid-stream error into counter updates (no
    /// retry — the client has the head of the stream already).
    fn wrap_stream(
        &self,
        first: WarpEvent,
        rest: EventStream,
        guard: AccountGuard,
        account_id: i64,
    ) -> EventStream {
        let store = Arc::clone(&self.store);
        let policy = self.policy.clone();

        Box::pin(async_stream::stream! {
            let _guard = guard;
            let first_terminal = first.is_terminal();
            yield first;
            if first_terminal {
                return;
            }

            let mut rest = rest;
            while let Some(event) = rest.next().await {
                if let WarpEvent::Error { message } = &event {
                    let outcome = classify_error_event(message);
                    record_midstream_failure(&store, &policy, account_id, &outcome, message);
                    yield event;
                    return;
                }
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    return;
                }
            }
        })
    }
}

/// Bucket an outcome into the aggregate-error categories.
fn bucket(outcome: &Outcome) -> AttemptFailureKind {
    match outcome {
        Outcome::ForbiddenWaf | Outcome::Unknown => AttemptFailureKind::Rejected,
        Outcome::AuthExpired => AttemptFailureKind::Refresh,
        _ => AttemptFailureKind::Unreachable,
    }
}

/// State transition for one classified failure.
fn failure_update(
    policy: &DispatchPolicy,
    account: &Account,
    outcome: &Outcome,
    message: &str,
) -> FailureUpdate {
    let next_errors = account.error_count + 1;
    let threshold_cooldown = |code: &str| {
        let demote = next_errors >= policy.failure_threshold;
        FailureUpdate {
            status: if demote {
                AccountStatus::Cooldown
            } else {
                account.status
            },
            cooldown_until: demote.then(|| time::future_iso(policy.cooldown_seconds)),
            code: code.into(),
            message: message.into(),
            zero_out_quota: false,
            bump_error_count: true,
        }
    };

    match outcome {
        Outcome::Ok => unreachable!("success is not a failure"),
        Outcome::AuthExpired => FailureUpdate {
            status: account.status,
            cooldown_until: None,
            code: "auth_expired".into(),
            message: message.into(),
            zero_out_quota: false,
            bump_error_count: true,
        },
        Outcome::ForbiddenWaf => threshold_cooldown("forbidden_waf"),
        Outcome::Unknown => threshold_cooldown("unknown"),
        Outcome::RateLimited { retry_after } => FailureUpdate {
            status: AccountStatus::Cooldown,
            cooldown_until: Some(time::future_iso(
                retry_after.map_or(policy.cooldown_seconds, |s| s as i64),
            )),
            code: "rate_limited".into(),
            message: message.into(),
            zero_out_quota: false,
            bump_error_count: true,
        },
        Outcome::QuotaExhausted => FailureUpdate {
            status: AccountStatus::QuotaExhausted,
            cooldown_until: Some(time::future_iso(policy.quota_cooldown_seconds)),
            code: "quota_exhausted".into(),
            message: message.into(),
            zero_out_quota: true,
            bump_error_count: true,
        },
        Outcome::Network => FailureUpdate {
            status: account.status,
            cooldown_until: None,
            code: "network".into(),
            message: message.into(),
            zero_out_quota: false,
            bump_error_count: true,
        },
        Outcome::ServerError => FailureUpdate {
            status: account.status,
            cooldown_until: None,
            code: "server_error".into(),
            message: message.into(),
            zero_out_quota: false,
            bump_error_count: true,
        },
    }
}

/// Counter update for an error after bytes already went to the client.
fn record_midstream_failure(
    store: &AccountStore,
    policy: &DispatchPolicy,
    account_id: i64,
    outcome: &Outcome,
    message: &str,
) {
    counter!(DISPATCH_ATTEMPTS_TOTAL, "outcome" => "midstream_error").increment(1);
    let account = match store.get(account_id) {
        Ok(Some(account)) => account,
        Ok(None) => return,
        Err(err) => {
            warn!(account_id, error = %err, "mid-stream failure lookup failed");
            return;
        }
    };
    let update = failure_update(policy, &account, outcome, message);
    if let Err(err) = store.record_failure(account_id, &update, Actor::Runtime, "dispatch_stream")
    {
        warn!(account_id, error = %err, "mid-stream failure update failed");
    }
}

/// Transport-error observations, pre-chewed for the classifier.
struct Observed {
    status: Option<u16>,
    retry_after: Option<u64>,
    body: String,
    network: bool,
    token_past_expiry: bool,
}

impl Observed {
    fn failure(&self) -> AttemptFailure<'_> {
        AttemptFailure {
            http_status: self.status,
            retry_after: self.retry_after,
            body: &self.body,
            network_error: self.network,
            token_past_expiry: self.token_past_expiry,
        }
    }

    fn detail(&self) -> String {
        match self.status {
            Some(status) if !self.body.is_empty() => format!("HTTP {status}: {}", self.body),
            Some(status) => format!("HTTP {status}"),
            None => self.body.clone(),
        }
    }
}

fn observe(err: &TransportError, access_token: &str) -> Observed {
    match err {
        TransportError::Status {
            status,
            retry_after,
            body,
        } => Observed {
            status: Some(*status),
            retry_after: *retry_after,
            body: body.clone(),
            network: false,
            token_past_expiry: jwt::is_past_expiry(access_token, Utc::now()),
        },
        TransportError::Request(e) => Observed {
            status: None,
            retry_after: None,
            body: e.to_string(),
            network: true,
            token_past_expiry: false,
        },
        TransportError::Codec { message } => Observed {
            status: None,
            retry_after: None,
            body: message.clone(),
            network: false,
            token_past_expiry: false,
        },
    }
}

fn internal<E: std::fmt::Display>(err: E) -> GatewayError {
    GatewayError::Internal {
        detail: err.to_string(),
    }
}

fn internal_msg(msg: &str) -> GatewayError {
    GatewayError::Internal {
        detail: msg.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
