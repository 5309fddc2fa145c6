//! Refresh-token exchange with the identity provider.
//!
//! One HTTPS POST per attempt, with linear-backoff retries for transient
//! failures. Outcomes are classified into [`RefreshOutcome`] so the
//! dispatch layer can drive account state transitions without looking at
//! HTTP details.

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use warpflow_core::Config;

use crate::errors::AuthError;
use crate::jwt;

/// Default access-token lifetime assumed when the provider reports none
/// and the token carries no decodable `exp` claim.
const FALLBACK_LIFETIME_SECONDS: i64 = 3600;

/// Configuration for the refresher.
#[derive(Clone, Debug)]
pub struct RefresherConfig {
    /// Identity-provider token endpoint.
    pub token_url: String,
    /// Per-attempt request timeout.
    pub timeout: Duration,
    /// Attempts per refresh (minimum 1).
    pub retry_count: u32,
    /// Linear backoff base between attempts.
    pub retry_base_delay: Duration,
    /// Client version header value.
    pub client_version: String,
    /// OS category header value.
    pub os_category: String,
    /// OS name header value.
    pub os_name: String,
    /// OS version header value.
    pub os_version: String,
}

impl RefresherConfig {
    /// Build from the gateway configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            token_url: config.identity_token_url.clone(),
            timeout: Duration::from_secs(config.refresh_timeout_seconds),
            retry_count: config.refresh_retry_count.max(1),
            retry_base_delay: Duration::from_millis(config.refresh_retry_base_delay_ms),
            client_version: config.client_version.clone(),
            os_category: config.os_category.clone(),
            os_name: config.os_name.clone(),
            os_version: config.os_version.clone(),
        }
    }
}

/// A successful exchange: fresh access token plus rotation info.
#[derive(Clone, Debug)]
pub struct TokenGrant {
    /// The short-lived credential to present upstream.
    pub access_token: String,
    /// Replacement refresh token, when the provider rotated it.
    pub refresh_token: Option<String>,
    /// RFC 3339 expiry of the access token.
    pub expires_at: String,
}

/// Classified result of one refresh (after retries).
#[derive(Clone, Debug)]
pub enum RefreshOutcome {
    /// Exchange succeeded.
    Ok(TokenGrant),
    /// The provider rejected the refresh token outright (revoked or
    /// invalid grant). The account should be blocked.
    Rejected {
        /// Machine-readable code.
        code: String,
        /// Human-readable message.
        message: String,
    },
    /// A retryable provider-side failure; the account keeps its status.
    Transient {
        /// Machine-readable code.
        code: String,
        /// Human-readable message.
        message: String,
    },
    /// The provider was unreachable (DNS, connect, timeout, reset).
    Network {
        /// Human-readable message.
        message: String,
    },
    /// The response body carried an explicit out-of-quota signal.
    QuotaExhausted {
        /// Human-readable message.
        message: String,
    },
}

impl RefreshOutcome {
    /// Short code for audit entries.
    pub fn code(&self) -> &str {
        match self {
            Self::Ok(_) => "ok",
            Self::Rejected { code, .. } | Self::Transient { code, .. } => code,
            Self::Network { .. } => "network",
            Self::QuotaExhausted { .. } => "quota_exhausted",
        }
    }

    /// Whether another attempt could change the answer.
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Network { .. })
    }
}

/// Exchanges refresh tokens for access tokens.
pub struct Refresher {
    client: reqwest::Client,
    config: RefresherConfig,
}

impl Refresher {
    /// Create a refresher sharing the gateway's HTTP client.
    pub fn new(client: reqwest::Client, config: RefresherConfig) -> Self {
        Self { client, config }
    }

    /// Refresh with retries. Terminal rejections return immediately;
    /// transient and network failures back off linearly between attempts.
    #[instrument(skip_all)]
    pub async fn refresh(&self, refresh_token: &str) -> RefreshOutcome {
        let mut last = RefreshOutcome::Transient {
            code: "refresh_failed".into(),
            message: "refresh not attempted".into(),
        };

        for attempt in 1..=self.config.retry_count {
            match self.exchange(refresh_token).await {
                Ok(grant) => {
                    if attempt > 1 {
                        debug!(attempt, "refresh succeeded after retry");
                    }
                    return RefreshOutcome::Ok(grant);
                }
                Err(err) => {
                    let outcome = classify_exchange_error(&err);
                    if !outcome.is_retryable() {
                        return outcome;
                    }
                    warn!(attempt, code = outcome.code(), "refresh attempt failed");
                    last = outcome;
                }
            }

            if attempt < self.config.retry_count {
                let delay = self.config.retry_base_delay * attempt;
                tokio::time::sleep(delay).await;
            }
        }

        last
    }

    /// One raw exchange against the token endpoint.
    async fn exchange(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        let resp = self
            .client
            .post(&self.config.token_url)
            .timeout(self.config.timeout)
            .header("x-warp-client-version", &self.config.client_version)
            .header("x-warp-os-category", &self.config.os_category)
            .header("x-warp-os-name", &self.config.os_name)
            .header("x-warp-os-version", &self.config.os_version)
            .json(&serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
            }))
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let message = resp.text().await.unwrap_or_default();
            return Err(AuthError::Exchange { status, message });
        }

        let data: Value = resp.json().await?;
        let access_token = data["access_token"]
            .as_str()
            .or_else(|| data["id_token"].as_str())
            .unwrap_or_default()
            .trim()
            .to_string();
        if access_token.is_empty() {
            return Err(AuthError::EmptyAccessToken);
        }

        let rotated = data["refresh_token"]
            .as_str()
            .map(str::trim)
            .filter(|t| !t.is_empty() && *t != refresh_token)
            .map(String::from);

        Ok(TokenGrant {
            expires_at: grant_expiry(&data, &access_token),
            access_token,
            refresh_token: rotated,
        })
    }
}

/// Compute the access-token expiry from `expires_in` (number or string),
/// the token's own `exp` claim, or the fallback lifetime — in that order.
fn grant_expiry(data: &Value, access_token: &str) -> String {
    let expires_in = match &data["expires_in"] {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    if let Some(seconds) = expires_in.filter(|s| *s > 0) {
        return (Utc::now() + ChronoDuration::seconds(seconds)).to_rfc3339();
    }
    if let Some(exp) = jwt::expiry(access_token) {
        return exp.to_rfc3339();
    }
    (Utc::now() + ChronoDuration::seconds(FALLBACK_LIFETIME_SECONDS)).to_rfc3339()
}

/// Map an exchange error onto the refresh outcome table.
fn classify_exchange_error(err: &AuthError) -> RefreshOutcome {
    match err {
        AuthError::Http(e) => RefreshOutcome::Network {
            message: e.to_string(),
        },
        AuthError::Exchange { status, message } => {
            let low = message.to_lowercase();
            if is_hard_invalid(&low) {
                let (code, message) = parse_provider_error(message);
                return RefreshOutcome::Rejected { code, message };
            }
            if is_quota_signal(&low) {
                return RefreshOutcome::QuotaExhausted {
                    message: truncate(message, 240),
                };
            }
            let (code, parsed) = parse_provider_error(message);
            RefreshOutcome::Transient {
                code: if code == "refresh_failed" {
                    format!("http_{status}")
                } else {
                    code
                },
                message: parsed,
            }
        }
        AuthError::EmptyAccessToken | AuthError::Json(_) | AuthError::Quota(_) => {
            RefreshOutcome::Transient {
                code: "refresh_failed".into(),
                message: err.to_string(),
            }
        }
    }
}

/// Markers that mean the refresh token itself is dead.
fn is_hard_invalid(low: &str) -> bool {
    low.contains("invalid_refresh_token")
        || low.contains("invalid_grant")
        || low.contains("refresh token is invalid")
        || low.contains("revoked")
}

/// Markers for an explicit out-of-quota body.
fn is_quota_signal(low: &str) -> bool {
    low.contains("no remaining quota") || low.contains("no ai requests remaining")
}

/// Extract `(code, message)` from a provider error body.
///
/// Handles the provider envelope `{"error": {"message", "status", "code"}}`
/// and falls back to the raw text.
fn parse_provider_error(raw: &str) -> (String, String) {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return ("refresh_failed".into(), "refresh failed".into());
    }

    let upper = trimmed.to_uppercase();
    if upper.contains("INVALID_REFRESH_TOKEN") {
        return ("invalid_refresh_token".into(), "INVALID_REFRESH_TOKEN".into());
    }
    if upper.contains("INVALID_GRANT") {
        return ("invalid_grant".into(), "INVALID_GRANT".into());
    }

    if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
        if let Some(msg) = json["error"]["message"].as_str() {
            let mut message = msg.trim().to_string();
            if let Some(status) = json["error"]["status"].as_str() {
                message = format!("{message} ({status})");
            }
            if let Some(code) = json["error"]["code"].as_i64() {
                message = format!("{message}, HTTP {code}");
            }
            let code = msg.trim().to_lowercase();
            return (truncate(&code, 64), truncate(&message, 240));
        }
    }

    ("refresh_failed".into(), truncate(trimmed, 240))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_grant_is_rejected() {
        let err = AuthError::Exchange {
            status: 400,
            message: r#"{"error":{"code":400,"message":"INVALID_REFRESH_TOKEN","status":"INVALID_ARGUMENT"}}"#.into(),
        };
        match classify_exchange_error(&err) {
            RefreshOutcome::Rejected { code, message } => {
                assert_eq!(code, "invalid_refresh_token");
                assert_eq!(message, "INVALID_REFRESH_TOKEN");
            }
            other => panic!("expected rejected, got {other:?}"),
        }
    }

    #[test]
    fn revoked_token_is_rejected() {
        let err = AuthError::Exchange {
            status: 400,
            message: "token has been revoked by the user".into(),
        };
        assert!(matches!(
            classify_exchange_error(&err),
            RefreshOutcome::Rejected { .. }
        ));
    }

    #[test]
    fn server_error_is_transient() {
        let err = AuthError::Exchange {
            status: 503,
            message: "upstream overloaded".into(),
        };
        match classify_exchange_error(&err) {
            RefreshOutcome::Transient { code, .. } => assert_eq!(code, "http_503"),
            other => panic!("expected transient, got {other:?}"),
        }
    }

    #[test]
    fn quota_body_is_quota_exhausted() {
        let err = AuthError::Exchange {
            status: 403,
            message: "No remaining quota for this account".into(),
        };
        assert!(matches!(
            classify_exchange_error(&err),
            RefreshOutcome::QuotaExhausted { .. }
        ));
    }

    #[test]
    fn empty_access_token_is_transient() {
        assert!(matches!(
            classify_exchange_error(&AuthError::EmptyAccessToken),
            RefreshOutcome::Transient { .. }
        ));
    }

    #[test]
    fn provider_envelope_parsed() {
        let (code, message) = parse_provider_error(
            r#"{"error":{"code":429,"message":"Quota check failed","status":"RESOURCE_EXHAUSTED"}}"#,
        );
        assert_eq!(code, "quota check failed");
        assert_eq!(message, "Quota check failed (RESOURCE_EXHAUSTED), HTTP 429");
    }

    #[test]
    fn raw_text_falls_through() {
        let (code, message) = parse_provider_error("gateway timeout");
        assert_eq!(code, "refresh_failed");
        assert_eq!(message, "gateway timeout");
    }

    #[test]
    fn grant_expiry_prefers_expires_in() {
        let data = serde_json::json!({"expires_in": "3600"});
        let at = grant_expiry(&data, "not-a-jwt");
        let parsed = warpflow_core::time::parse_iso(&at).unwrap();
        let delta = (parsed - Utc::now()).num_seconds();
        assert!((3598..=3600).contains(&delta), "got {delta}");
    }

    #[test]
    fn grant_expiry_falls_back_to_default() {
        let data = serde_json::json!({});
        let at = grant_expiry(&data, "not-a-jwt");
        let parsed = warpflow_core::time::parse_iso(&at).unwrap();
        let delta = (parsed - Utc::now()).num_seconds();
        assert!((3598..=3600).contains(&delta), "got {delta}");
    }

    #[test]
    fn outcome_codes_are_stable() {
        assert_eq!(
            RefreshOutcome::Network {
                message: "x".into()
            }
            .code(),
            "network"
        );
        assert_eq!(
            RefreshOutcome::QuotaExhausted {
                message: "x".into()
            }
            .code(),
            "quota_exhausted"
        );
    }
}
