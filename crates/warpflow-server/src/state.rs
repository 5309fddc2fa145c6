//! Shared state accessible from axum handlers.

use std::sync::Arc;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;

use warpflow_core::Config;
use warpflow_dispatch::{AccountLocks, Dispatcher, HealthMonitor, RefreshCoordinator};
use warpflow_store::AccountStore;

use crate::shutdown::ShutdownCoordinator;

/// Everything a handler can reach.
#[derive(Clone)]
pub struct AppState {
    /// The process-wide account store.
    pub store: Arc<AccountStore>,
    /// The single upstream channel.
    pub dispatcher: Arc<Dispatcher>,
    /// Forced-refresh path for the admin surface.
    pub refresh: Arc<RefreshCoordinator>,
    /// Per-account exclusivity locks (shared with the dispatcher).
    pub locks: Arc<AccountLocks>,
    /// Background health monitor (status reads + manual passes).
    pub monitor: Arc<HealthMonitor>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Gateway configuration.
    pub config: Arc<Config>,
    /// Prometheus handle for `/metrics`.
    pub metrics_handle: Arc<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
}
