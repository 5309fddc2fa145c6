//! Caller-facing error taxonomy.
//!
//! Per-attempt failures inside the dispatch pipeline are absorbed into
//! account state transitions; only the aggregate outcome escapes as a
//! [`GatewayError`]. Each variant maps to a stable HTTP status for the
//! protocol adapters.

use thiserror::Error;

/// Aggregate outcome of a request the gateway could not serve.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No eligible account exists right now.
    #[error("no ready account available")]
    Unavailable {
        /// RFC 3339 instant of the soonest expected recovery, if known.
        next_recovery_at: Option<String>,
    },

    /// Every tried account failed the identity-provider exchange.
    #[error("all accounts failed token refresh: {detail}")]
    AuthFailed {
        /// Last refresh error observed.
        detail: String,
    },

    /// Every tried account received a terminal upstream 4xx.
    #[error("upstream rejected the request: {detail}")]
    UpstreamRejected {
        /// Last rejection observed.
        detail: String,
    },

    /// Every tried account hit network failures or upstream 5xx.
    #[error("upstream unreachable: {detail}")]
    UpstreamUnreachable {
        /// Last transport error observed.
        detail: String,
    },

    /// The inbound request was malformed before any upstream attempt.
    #[error("invalid request: {detail}")]
    RequestInvalid {
        /// What was wrong with the request.
        detail: String,
    },

    /// A bug or unrecoverable internal failure (store errors included).
    #[error("internal error: {detail}")]
    Internal {
        /// Diagnostic detail; not meant for end users.
        detail: String,
    },
}

impl GatewayError {
    /// Stable HTTP status for adapter responses.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unavailable { .. } | Self::UpstreamUnreachable { .. } => 503,
            Self::AuthFailed { .. } | Self::UpstreamRejected { .. } => 502,
            Self::RequestInvalid { .. } => 400,
            Self::Internal { .. } => 500,
        }
    }

    /// Stable machine-readable code for response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "no_ready_account",
            Self::AuthFailed { .. } => "auth_failed",
            Self::UpstreamRejected { .. } => "upstream_rejected",
            Self::UpstreamUnreachable { .. } => "upstream_unreachable",
            Self::RequestInvalid { .. } => "request_invalid",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Convenience alias for gateway-level results.
pub type GatewayResult<T> = Result<T, GatewayError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_is_stable() {
        assert_eq!(
            GatewayError::Unavailable {
                next_recovery_at: None
            }
            .http_status(),
            503
        );
        assert_eq!(
            GatewayError::AuthFailed {
                detail: "x".into()
            }
            .http_status(),
            502
        );
        assert_eq!(
            GatewayError::UpstreamRejected {
                detail: "x".into()
            }
            .http_status(),
            502
        );
        assert_eq!(
            GatewayError::UpstreamUnreachable {
                detail: "x".into()
            }
            .http_status(),
            503
        );
        assert_eq!(
            GatewayError::RequestInvalid {
                detail: "x".into()
            }
            .http_status(),
            400
        );
        assert_eq!(
            GatewayError::Internal {
                detail: "x".into()
            }
            .http_status(),
            500
        );
    }

    #[test]
    fn unavailable_code_matches_contract() {
        let err = GatewayError::Unavailable {
            next_recovery_at: Some("2026-01-01T00:00:00Z".into()),
        };
        assert_eq!(err.code(), "no_ready_account");
    }

    #[test]
    fn display_includes_detail() {
        let err = GatewayError::UpstreamRejected {
            detail: "model not allowed".into(),
        };
        assert!(err.to_string().contains("model not allowed"));
    }
}
