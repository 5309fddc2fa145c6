//! Auth error types.

/// Errors that can occur during identity-provider operations.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Token exchange was answered with a non-success status.
    #[error("token exchange error ({status}): {message}")]
    Exchange {
        /// HTTP status code (0 if no response).
        status: u16,
        /// Error description.
        message: String,
    },

    /// The exchange succeeded but carried no usable access token.
    #[error("token exchange returned empty access token")]
    EmptyAccessToken,

    /// The quota endpoint answered with an application-level error.
    #[error("quota query error: {0}")]
    Quota(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
