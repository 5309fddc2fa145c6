//! # warpflow-auth
//!
//! Identity-provider integration: exchanges a refresh token for a
//! short-lived access token, classifies the outcome, probes the upstream
//! quota endpoint, and decodes JWT expiry claims.
//!
//! This crate performs HTTP only — nothing here touches the account store.
//! The dispatch layer owns persisting refresh outcomes.

pub mod errors;
pub mod jwt;
pub mod quota;
pub mod refresher;

pub use errors::AuthError;
pub use quota::QuotaProbe;
pub use refresher::{RefreshOutcome, Refresher, RefresherConfig, TokenGrant};
