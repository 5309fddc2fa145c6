//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default timeout for graceful shutdown before force-exiting.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Coordinates graceful shutdown across all server tasks.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    /// Registered background task handles (e.g. the health monitor).
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            task_handles: Mutex::new(Vec::new()),
        }
    }

    /// Register a background task handle for graceful shutdown.
    pub fn register_task(&self, handle: JoinHandle<()>) {
        self.task_handles.lock().push(handle);
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Perform a graceful shutdown of all tracked tasks.
    ///
    /// 1. Cancel the shutdown token (signals all tasks)
    /// 2. Wait up to `timeout` for all handles to complete
    /// 3. Abort any remaining tasks after timeout
    pub async fn graceful_shutdown(&self, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        self.shutdown();
        let handles = std::mem::take(&mut *self.task_handles.lock());

        info!(
            task_count = handles.len(),
            timeout_secs = timeout.as_secs(),
            "waiting for tasks to complete"
        );

        let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
            Ok(_) => {
                info!("all shutdown tasks completed");
            }
            Err(_) => {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "shutdown timed out, aborting remaining tasks"
                );
                for handle in &abort_handles {
                    handle.abort();
                }
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve when the process receives SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                let _ = signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
