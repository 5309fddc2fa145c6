//! Failure classification.
//!
//! A pure function from transport observations (HTTP status, `Retry-After`,
//! body snippet, network-error flag, JWT-expiry signal) to a typed
//! [`Outcome`]. Deterministic and side-effect free; the dispatch pipeline
//! turns outcomes into state transitions.

/// Classified result of one upstream attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The attempt succeeded.
    Ok,
    /// The presented access token is expired; refresh and retry once.
    AuthExpired,
    /// A 403 that is not a credential problem (WAF, account restriction).
    ForbiddenWaf,
    /// Upstream rate limit.
    RateLimited {
        /// `Retry-After` in seconds, when upstream provided one.
        retry_after: Option<u64>,
    },
    /// The account has no upstream quota left.
    QuotaExhausted,
    /// Connection-level failure (DNS, refused, reset, timeout).
    Network,
    /// Upstream 5xx.
    ServerError,
    /// Anything else. Never demotes beyond an error-count bump.
    Unknown,
}

impl Outcome {
    /// Short code for audit entries and metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::AuthExpired => "auth_expired",
            Self::ForbiddenWaf => "forbidden_waf",
            Self::RateLimited { .. } => "rate_limited",
            Self::QuotaExhausted => "quota_exhausted",
            Self::Network => "network",
            Self::ServerError => "server_error",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the same request may be worth another account.
    pub fn rotates(&self) -> bool {
        !matches!(self, Self::Ok | Self::AuthExpired)
    }
}

/// Observations from one failed attempt.
#[derive(Clone, Debug, Default)]
pub struct AttemptFailure<'a> {
    /// HTTP status, when a response arrived.
    pub http_status: Option<u16>,
    /// `Retry-After` header in seconds.
    pub retry_after: Option<u64>,
    /// Leading body snippet.
    pub body: &'a str,
    /// The request never produced a response.
    pub network_error: bool,
    /// The presented access token was already past its `exp` claim.
    pub token_past_expiry: bool,
}

/// Markers upstream uses for an exhausted request budget.
fn is_quota_marker(low: &str) -> bool {
    low.contains("no remaining quota") || low.contains("no ai requests remaining")
}

/// Markers for account-level model restrictions; terminal for this
/// account but not a credential problem.
fn is_model_restriction(low: &str) -> bool {
    low.contains("not allowed for your account")
}

/// Classify one attempt.
pub fn classify(failure: &AttemptFailure<'_>) -> Outcome {
    if failure.network_error {
        return Outcome::Network;
    }

    let low = failure.body.to_lowercase();
    if is_quota_marker(&low) {
        return Outcome::QuotaExhausted;
    }

    match failure.http_status {
        Some(401) => Outcome::AuthExpired,
        Some(403) => {
            if failure.token_past_expiry {
                Outcome::AuthExpired
            } else {
                Outcome::ForbiddenWaf
            }
        }
        Some(429) => Outcome::RateLimited {
            retry_after: failure.retry_after,
        },
        Some(s) if s >= 500 => Outcome::ServerError,
        _ => {
            if is_model_restriction(&low) {
                Outcome::ForbiddenWaf
            } else {
                Outcome::Unknown
            }
        }
    }
}

/// Classify an in-band error event (a 200 response whose stream carried an
/// error frame). Only body markers are available here.
pub fn classify_error_event(message: &str) -> Outcome {
    let low = message.to_lowercase();
    if is_quota_marker(&low) {
        return Outcome::QuotaExhausted;
    }
    if is_model_restriction(&low) {
        return Outcome::ForbiddenWaf;
    }
    if low.contains("timed out")
        || low.contains("timeout")
        || low.contains("connection refused")
        || low.contains("connection reset")
        || low.contains("connection failed")
        || low.contains("failed to fetch")
    {
        return Outcome::Network;
    }
    if low.contains("something went wrong with this conversation") {
        return Outcome::ServerError;
    }
    Outcome::Unknown
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> AttemptFailure<'static> {
        AttemptFailure {
            http_status: Some(code),
            ..Default::default()
        }
    }

    #[test]
    fn network_error_wins() {
        let failure = AttemptFailure {
            network_error: true,
            http_status: Some(500),
            ..Default::default()
        };
        assert_eq!(classify(&failure), Outcome::Network);
    }

    #[test]
    fn status_table() {
        assert_eq!(classify(&status(401)), Outcome::AuthExpired);
        assert_eq!(classify(&status(403)), Outcome::ForbiddenWaf);
        assert_eq!(
            classify(&status(429)),
            Outcome::RateLimited { retry_after: None }
        );
        assert_eq!(classify(&status(500)), Outcome::ServerError);
        assert_eq!(classify(&status(503)), Outcome::ServerError);
        assert_eq!(classify(&status(404)), Outcome::Unknown);
        assert_eq!(classify(&status(400)), Outcome::Unknown);
    }

    #[test]
    fn expired_token_flips_403_to_auth_expired() {
        let failure = AttemptFailure {
            http_status: Some(403),
            token_past_expiry: true,
            ..Default::default()
        };
        assert_eq!(classify(&failure), Outcome::AuthExpired);
    }

    #[test]
    fn retry_after_is_carried() {
        let failure = AttemptFailure {
            http_status: Some(429),
            retry_after: Some(30),
            ..Default::default()
        };
        assert_eq!(
            classify(&failure),
            Outcome::RateLimited {
                retry_after: Some(30)
            }
        );
    }

    #[test]
    fn quota_marker_overrides_status() {
        let failure = AttemptFailure {
            http_status: Some(429),
            body: "No remaining quota",
            ..Default::default()
        };
        assert_eq!(classify(&failure), Outcome::QuotaExhausted);

        let failure = AttemptFailure {
            http_status: Some(200),
            body: "no AI requests remaining this week",
            ..Default::default()
        };
        assert_eq!(classify(&failure), Outcome::QuotaExhausted);
    }

    #[test]
    fn model_restriction_is_forbidden() {
        let failure = AttemptFailure {
            http_status: Some(400),
            body: "requested base model x is not allowed for your account",
            ..Default::default()
        };
        assert_eq!(classify(&failure), Outcome::ForbiddenWaf);
    }

    #[test]
    fn error_event_classification() {
        assert_eq!(
            classify_error_event("No remaining quota"),
            Outcome::QuotaExhausted
        );
        assert_eq!(
            classify_error_event("upstream connection failed mid-stream: reset by peer"),
            Outcome::Network
        );
        assert_eq!(
            classify_error_event("upstream read timed out after 60s of silence"),
            Outcome::Network
        );
        assert_eq!(
            classify_error_event("Something went wrong with this conversation"),
            Outcome::ServerError
        );
        assert_eq!(
            classify_error_event("model gpt-x is not allowed for your account"),
            Outcome::ForbiddenWaf
        );
        assert_eq!(classify_error_event("mystery"), Outcome::Unknown);
    }

    #[test]
    fn rotation_policy() {
        assert!(!Outcome::Ok.rotates());
        assert!(!Outcome::AuthExpired.rotates());
        assert!(Outcome::Network.rotates());
        assert!(Outcome::QuotaExhausted.rotates());
        assert!(Outcome::Unknown.rotates());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(Outcome::ForbiddenWaf.code(), "forbidden_waf");
        assert_eq!(
            Outcome::RateLimited { retry_after: None }.code(),
            "rate_limited"
        );
    }
}
