//! # warpflow-core
//!
//! Shared foundation for the warpflow gateway: account status and quota
//! types, environment-driven configuration, the caller-facing error
//! taxonomy, token masking, and RFC 3339 time helpers.
//!
//! This crate has no I/O. Everything here is plain data used across the
//! store, auth, transport, dispatch, and server crates.

pub mod config;
pub mod error;
pub mod mask;
pub mod time;
pub mod types;

pub use config::Config;
pub use error::{GatewayError, GatewayResult};
pub use types::{AccountStatus, Actor, QuotaSnapshot};
