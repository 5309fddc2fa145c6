//! RFC 3339 time helpers.
//!
//! All persisted instants are RFC 3339 strings in UTC. These helpers keep
//! the parsing/formatting in one place so the store and the projections
//! agree on the representation.

use chrono::{DateTime, Duration, Utc};

/// Current instant as an RFC 3339 string.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Instant `seconds` from now as an RFC 3339 string.
pub fn future_iso(seconds: i64) -> String {
    (Utc::now() + Duration::seconds(seconds)).to_rfc3339()
}

/// Parse an RFC 3339 string; empty or malformed input yields `None`.
pub fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(trimmed)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Whether `instant` (RFC 3339) lies in the future relative to `now`.
///
/// Unparseable input counts as "not in the future" so a corrupted
/// `cooldown_until` never pins an account forever.
pub fn is_future(instant: &str, now: DateTime<Utc>) -> bool {
    parse_iso(instant).is_some_and(|dt| dt > now)
}

/// Seconds from `now` until `instant`, clamped at zero.
pub fn seconds_until(instant: &str, now: DateTime<Utc>) -> i64 {
    parse_iso(instant).map_or(0, |dt| (dt - now).num_seconds().max(0))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_roundtrips() {
        let s = now_iso();
        assert!(parse_iso(&s).is_some());
    }

    #[test]
    fn future_iso_is_in_the_future() {
        let s = future_iso(60);
        assert!(is_future(&s, Utc::now()));
    }

    #[test]
    fn past_instant_is_not_future() {
        let s = future_iso(-60);
        assert!(!is_future(&s, Utc::now()));
    }

    #[test]
    fn malformed_input_is_not_future() {
        assert!(!is_future("not-a-date", Utc::now()));
        assert!(!is_future("", Utc::now()));
        assert_eq!(parse_iso("garbage"), None);
    }

    #[test]
    fn seconds_until_clamps_at_zero() {
        assert_eq!(seconds_until(&future_iso(-120), Utc::now()), 0);
        let ahead = seconds_until(&future_iso(120), Utc::now());
        assert!((118..=120).contains(&ahead), "got {ahead}");
    }
}
