//! JWT payload decoding for expiry checks.
//!
//! The gateway never validates upstream signatures — it only needs the
//! `exp` claim to decide whether an access token is worth presenting and
//! whether a 401/403 carried an expiry signal.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

/// Safety buffer subtracted from `exp` when judging usability.
pub const EXPIRY_BUFFER_SECONDS: i64 = 300;

/// Decode the payload segment of a JWT. Returns `None` for anything that
/// is not a three-segment token with a base64url JSON payload.
pub fn decode_payload(token: &str) -> Option<Value> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;
    let _signature = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// The `exp` claim as a UTC instant, if present.
pub fn expiry(token: &str) -> Option<DateTime<Utc>> {
    let exp = decode_payload(token)?.get("exp")?.as_i64()?;
    Utc.timestamp_opt(exp, 0).single()
}

/// Whether the token is expired (or undecodable) at `now`, with the
/// standard safety buffer applied.
pub fn is_expired(token: &str, now: DateTime<Utc>) -> bool {
    match expiry(token) {
        Some(exp) => (exp - now).num_seconds() <= EXPIRY_BUFFER_SECONDS,
        None => true,
    }
}

/// Whether the token's remaining lifetime is strictly negative at `now`.
///
/// This is the "expiry signal" the failure classifier uses to separate an
/// expired-credential 401/403 from a WAF rejection.
pub fn is_past_expiry(token: &str, now: DateTime<Utc>) -> bool {
    expiry(token).is_some_and(|exp| exp < now)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_jwt(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp},"sub":"u"}}"#));
        format!("{header}.{payload}.sig")
    }

    #[test]
    fn decodes_exp_claim() {
        let token = make_jwt(1_900_000_000);
        assert_eq!(expiry(&token).unwrap().timestamp(), 1_900_000_000);
    }

    #[test]
    fn fresh_token_is_not_expired() {
        let exp = Utc::now().timestamp() + 3600;
        assert!(!is_expired(&make_jwt(exp), Utc::now()));
        assert!(!is_past_expiry(&make_jwt(exp), Utc::now()));
    }

    #[test]
    fn token_inside_buffer_counts_as_expired() {
        let exp = Utc::now().timestamp() + 60;
        assert!(is_expired(&make_jwt(exp), Utc::now()));
        // But it is not yet past its hard expiry.
        assert!(!is_past_expiry(&make_jwt(exp), Utc::now()));
    }

    #[test]
    fn stale_token_is_past_expiry() {
        let exp = Utc::now().timestamp() - 60;
        assert!(is_expired(&make_jwt(exp), Utc::now()));
        assert!(is_past_expiry(&make_jwt(exp), Utc::now()));
    }

    #[test]
    fn garbage_is_treated_as_expired() {
        assert!(is_expired("not-a-jwt", Utc::now()));
        assert!(is_expired("a.b", Utc::now()));
        assert!(!is_past_expiry("not-a-jwt", Utc::now()), "no signal without exp");
        assert_eq!(decode_payload("a.!!!.c"), None);
    }
}
