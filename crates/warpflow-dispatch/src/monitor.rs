//! Background health monitor.
//!
//! One pass probes every `active`/`cooldown` account by running a real
//! refresh (opportunistically — busy accounts are skipped), measures
//! latency, writes the health snapshot, and demotes accounts whose
//! consecutive failures cross the threshold. At most one pass runs at a
//! time; shutdown is cooperative through a `CancellationToken` and
//! bounded by the per-account probe timeout.
//!
//! The monitor writes through the store only — it never talks to the
//! dispatch pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use warpflow_core::{time, AccountStatus, Actor, Config};
use warpflow_store::{AccountStore, FailureUpdate, HealthSnapshot, Result as StoreResult};

use crate::locks::AccountLocks;
use crate::refresh::{RefreshCoordinator, RefreshResult};

/// Monitor tunables.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Delay between passes.
    pub interval: Duration,
    /// Per-account probe timeout.
    pub probe_timeout: Duration,
    /// Consecutive failures that demote an active account.
    pub fail_threshold: i64,
    /// Cooldown applied on demotion, in seconds.
    pub cooldown_seconds: i64,
}

impl MonitorConfig {
    /// Build from the gateway configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: Duration::from_secs(config.pool_refresh_interval_seconds.max(15)),
            probe_timeout: Duration::from_secs(config.health_probe_timeout_seconds),
            fail_threshold: i64::from(config.health_fail_threshold.max(1)),
            cooldown_seconds: config.cooldown_seconds,
        }
    }
}

/// Aggregate monitor state for the admin surface.
#[derive(Clone, Debug, Serialize)]
pub struct MonitorStatus {
    /// Whether the background loop is alive.
    pub running: bool,
    /// Configured pass period in seconds.
    pub interval_seconds: u64,
    /// RFC 3339 instant the last pass started, if any.
    pub last_pass_at: Option<String>,
    /// Accounts whose last probe succeeded.
    pub healthy: i64,
    /// Accounts whose last probe failed.
    pub unhealthy: i64,
}

/// Summary of one pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Accounts probed.
    pub probed: usize,
    /// Probes that succeeded.
    pub healthy: usize,
    /// Accounts skipped because their lock was busy.
    pub skipped_busy: usize,
    /// Accounts demoted to cooldown this pass.
    pub demoted: usize,
}

/// Periodic account prober.
pub struct HealthMonitor {
    store: Arc<AccountStore>,
    refresh: RefreshCoordinator,
    locks: Arc<AccountLocks>,
    config: MonitorConfig,
    running: AtomicBool,
    last_pass_at: Mutex<Option<String>>,
    pass_lock: AsyncMutex<()>,
}

impl HealthMonitor {
    /// Wire up the monitor.
    pub fn new(
        store: Arc<AccountStore>,
        refresh: RefreshCoordinator,
        locks: Arc<AccountLocks>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            store,
            refresh,
            locks,
            config,
            running: AtomicBool::new(false),
            last_pass_at: Mutex::new(None),
            pass_lock: AsyncMutex::new(()),
        }
    }

    /// Current monitor status plus snapshot counts.
    pub fn status(&self) -> StoreResult<MonitorStatus> {
        let stats = self.store.statistics()?;
        Ok(MonitorStatus {
            running: self.running.load(Ordering::SeqCst),
            interval_seconds: self.config.interval.as_secs(),
            last_pass_at: self.last_pass_at.lock().clone(),
            healthy: stats.healthy,
            unhealthy: stats.unhealthy,
        })
    }

    /// Run passes until `cancel` fires. One pass at startup, then one per
    /// interval.
    pub async fn run(&self, cancel: CancellationToken) {
        self.running.store(true, Ordering::SeqCst);
        info!(
            interval_secs = self.config.interval.as_secs(),
            "health monitor started"
        );

        loop {
            match self.pass().await {
                Ok(summary) => debug!(?summary, "health pass complete"),
                Err(err) => warn!(error = %err, "health pass failed"),
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.interval) => {}
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("health monitor stopped");
    }

    /// Run one pass now. Returns immediately if another pass is running.
    #[instrument(skip_all)]
    pub async fn pass(&self) -> StoreResult<PassSummary> {
        let Ok(_pass) = self.pass_lock.try_lock() else {
            debug!("health pass already in progress, skipping");
            return Ok(PassSummary::default());
        };
        *self.last_pass_at.lock() = Some(time::now_iso());

        let mut summary = PassSummary::default();
        for account in self.store.list()? {
            if !matches!(
                account.status,
                AccountStatus::Active | AccountStatus::Cooldown
            ) {
                continue;
            }

            // Opportunistic: never contend with a live dispatch.
            let Some(_guard) = self.locks.try_acquire(account.id) else {
                summary.skipped_busy += 1;
                continue;
            };

            summary.probed += 1;
            let started = Instant::now();
            let probe = tokio::time::timeout(
                self.config.probe_timeout,
                self.refresh.refresh_account(&account, Actor::Monitor),
            )
            .await;
            let latency_ms = started.elapsed().as_millis() as i64;

            match probe {
                Ok(Ok(RefreshResult::Ok(_))) => {
                    summary.healthy += 1;
                    self.write_snapshot(account.id, true, latency_ms, None)?;
                }
                Ok(Ok(RefreshResult::Failed { message, .. })) => {
                    summary.demoted +=
                        usize::from(self.handle_probe_failure(&account, latency_ms, &message)?);
                }
                Ok(Err(err)) => return Err(err),
                Err(_elapsed) => {
                    let message = format!(
                        "health probe timed out after {}s",
                        self.config.probe_timeout.as_secs()
                    );
                    summary.demoted +=
                        usize::from(self.handle_probe_failure(&account, latency_ms, &message)?);
                }
            }
        }

        Ok(summary)
    }

    /// Record a failed probe; demote when the streak crosses the
    /// threshold. Returns whether a demotion happened.
    fn handle_probe_failure(
        &self,
        account: &warpflow_store::Account,
        latency_ms: i64,
        message: &str,
    ) -> StoreResult<bool> {
        let failures = self
            .store
            .read_health(account.id)?
            .map_or(0, |h| h.consecutive_failures)
            + 1;
        self.write_snapshot(account.id, false, latency_ms, Some((failures, message)))?;

        if failures >= self.config.fail_threshold && account.status == AccountStatus::Active {
            info!(
                account_id = account.id,
                failures, "demoting account after repeated failed probes"
            );
            let _ = self.store.record_failure(
                account.id,
                &FailureUpdate {
                    status: AccountStatus::Cooldown,
                    cooldown_until: Some(time::future_iso(self.config.cooldown_seconds)),
                    code: "health_demotion".into(),
                    message: message.into(),
                    zero_out_quota: false,
                    // The dispatch error counter tracks send failures;
                    // probe streaks live in the snapshot.
                    bump_error_count: false,
                },
                Actor::Monitor,
                "health_check",
            )?;
            return Ok(true);
        }
        Ok(false)
    }

    fn write_snapshot(
        &self,
        account_id: i64,
        healthy: bool,
        latency_ms: i64,
        failure: Option<(i64, &str)>,
    ) -> StoreResult<()> {
        let now = time::now_iso();
        let prev_success = if healthy {
            Some(now.clone())
        } else {
            self.store
                .read_health(account_id)?
                .and_then(|h| h.last_success_at)
        };
        self.store.snapshot_health(&HealthSnapshot {
            account_id,
            healthy: Some(healthy),
            last_checked_at: Some(now.clone()),
            last_success_at: prev_success,
            consecutive_failures: failure.map_or(0, |(count, _)| count),
            latency_ms: Some(latency_ms),
            last_error: failure.map(|(_, msg)| msg.to_string()),
            updated_at: now,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
