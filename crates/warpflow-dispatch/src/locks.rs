//! Per-account exclusivity locks.
//!
//! INVARIANT: at most one upstream send or refresh is in flight per
//! account. The registry hands out `Arc<tokio::sync::Mutex<()>>` handles
//! keyed by account id; guards are owned so they can ride inside a
//! response stream for its whole life. Dead entries are pruned
//! opportunistically once the map grows.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Guard proving exclusive access to one account.
pub type AccountGuard = OwnedMutexGuard<()>;

/// Registry of per-account locks.
#[derive(Default)]
pub struct AccountLocks {
    inner: Mutex<HashMap<i64, Weak<AsyncMutex<()>>>>,
}

impl AccountLocks {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, account_id: i64) -> Arc<AsyncMutex<()>> {
        let mut locks = self.inner.lock();

        // Opportunistically prune dead weak refs when the map grows.
        if locks.len() > 256 {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }

        if let Some(existing) = locks.get(&account_id).and_then(Weak::upgrade) {
            return existing;
        }

        let lock = Arc::new(AsyncMutex::new(()));
        let _ = locks.insert(account_id, Arc::downgrade(&lock));
        lock
    }

    /// Non-blocking acquire. Returns `None` when the account is busy.
    pub fn try_acquire(&self, account_id: i64) -> Option<AccountGuard> {
        self.handle(account_id).try_lock_owned().ok()
    }

    /// Blocking acquire (used for refresh-after-auth-expired).
    pub async fn acquire(&self, account_id: i64) -> AccountGuard {
        self.handle(account_id).lock_owned().await
    }

    /// Acquire with a deadline. Returns `None` on timeout.
    pub async fn acquire_timeout(
        &self,
        account_id: i64,
        timeout: Duration,
    ) -> Option<AccountGuard> {
        tokio::time::timeout(timeout, self.acquire(account_id))
            .await
            .ok()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
