//! Credential masking for display.
//!
//! No API response ever carries a complete refresh token. Masking keeps a
//! fixed-length head and tail so operators can still tell accounts apart.

/// Characters kept from the start of a masked token.
const PREVIEW_HEAD: usize = 6;
/// Characters kept from the end of a masked token.
const PREVIEW_TAIL: usize = 4;

/// Mask a credential as `{prefix}…{suffix}`.
///
/// Head and tail are counted in characters, never bytes. Very short
/// inputs keep only the first two characters so the mask never reveals
/// more than it hides.
pub fn token_preview(token: &str) -> String {
    let t = token.trim();
    if t.is_empty() {
        return String::new();
    }
    let len = t.chars().count();
    if len <= PREVIEW_HEAD + PREVIEW_TAIL {
        let head: String = t.chars().take(2).collect();
        return format!("{head}***");
    }
    let head: String = t.chars().take(PREVIEW_HEAD).collect();
    let tail: String = t
        .chars()
        .skip(len - PREVIEW_TAIL)
        .collect();
    format!("{head}…{tail}")
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
