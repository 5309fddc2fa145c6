//! Transport error types.

use thiserror::Error;

/// Errors from one upstream send attempt.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request never produced a response (DNS, connect, timeout).
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Upstream answered with a non-success status before streaming.
    #[error("upstream status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// `Retry-After` header in seconds, when present and parseable.
        retry_after: Option<u64>,
        /// Leading body snippet for classification.
        body: String,
    },

    /// A frame could not be decoded by the event codec.
    #[error("codec error: {message}")]
    Codec {
        /// Error description.
        message: String,
    },
}

impl TransportError {
    /// Whether this failure happened without any upstream response.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Request(_))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_display() {
        let err = TransportError::Status {
            status: 429,
            retry_after: Some(30),
            body: "slow down".into(),
        };
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("slow down"));
        assert!(!err.is_network());
    }
}
