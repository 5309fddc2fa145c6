//! Error types for the account store.
//!
//! [`StoreError`] is the single error type returned by store operations.
//! Store-layer failures are always fatal to the current operation — nothing
//! here is silently swallowed by callers.

use thiserror::Error;

use crate::crypto::CryptoError;

/// Errors that can occur during account store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `SQLite` database error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON serialization/deserialization error.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Schema migration failed.
    #[error("migration error: {message}")]
    Migration {
        /// Describes which migration failed and why.
        message: String,
    },

    /// Sealing or opening a refresh-token ciphertext failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Requested account was not found.
    #[error("account not found: {0}")]
    AccountNotFound(i64),

    /// An account with the same refresh-token fingerprint already exists.
    #[error("duplicate account fingerprint: {0}")]
    DuplicateAccount(String),

    /// Invalid operation on the store.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

/// Convenience type alias for store results.
pub type Result<T> = std::result::Result<T, StoreError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
