//! # warpflow-dispatch
//!
//! The single upstream channel: every client request funnels through
//! [`Dispatcher::dispatch`], which selects an eligible account, acquires
//! its exclusivity lock, refreshes credentials when needed, sends the
//! request, classifies the outcome, applies the state transition, and
//! fails over to the next account within the per-request budget.
//!
//! The background [`HealthMonitor`] and the [`readiness`] projection live
//! here too — they share the same selector predicates and store handle.
//!
//! This crate never imports adapter or server types; adapters depend on
//! it through the narrow [`Dispatcher`] surface.

pub mod classifier;
pub mod locks;
pub mod monitor;
pub mod pipeline;
pub mod readiness;
pub mod refresh;
pub mod selector;

pub use classifier::{classify, classify_error_event, AttemptFailure, Outcome};
pub use locks::{AccountGuard, AccountLocks};
pub use monitor::{HealthMonitor, MonitorConfig, MonitorStatus, PassSummary};
pub use pipeline::{DispatchPolicy, Dispatcher, SendChannel};
pub use readiness::{readiness, Readiness};
pub use refresh::{
    IdentityExchanger, RefreshCoordinator, RefreshPolicy, RefreshResult, TokenExchanger,
};
pub use selector::{AccountSelector, SelectorConfig};
