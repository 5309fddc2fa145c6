//! # warpflow-server
//!
//! Axum HTTP server: the operator admin surface under `/admin/api/tokens`,
//! the raw upstream send endpoint, liveness, and Prometheus metrics —
//! plus the bootstrap that wires the store, dispatcher, and health
//! monitor to the process lifecycle.

pub mod admin;
pub mod auth;
pub mod metrics;
pub mod send;
pub mod server;
pub mod shutdown;
pub mod state;

pub use server::{build_router, serve};
pub use shutdown::{shutdown_signal, ShutdownCoordinator};
pub use state::AppState;
