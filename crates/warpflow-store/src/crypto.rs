//! Authenticated encryption for refresh tokens at rest.
//!
//! AES-256-GCM with a 96-bit random nonce. The sealed blob layout is
//! `nonce || ciphertext || tag` — the nonce travels with the record, the
//! 128-bit GCM tag is appended by the cipher.
//!
//! The key comes from explicit configuration (32 bytes, base64url). When
//! absent, a stable development key is derived from a static salt plus a
//! machine-bound seed; this is logged loudly and must not be used in
//! production.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

/// GCM nonce length in bytes (96 bits).
const NONCE_LEN: usize = 12;

/// Salt mixed into the derived development key.
const DERIVED_KEY_SALT: &str = "warpflow-token-box-v1";

/// Errors from sealing or opening a refresh-token blob.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The plaintext to seal was empty.
    #[error("refresh token is empty")]
    EmptyPlaintext,

    /// The sealed blob is too short to contain a nonce and tag.
    #[error("sealed payload too short: {len} bytes")]
    TruncatedPayload {
        /// Observed blob length.
        len: usize,
    },

    /// Authenticated decryption failed (wrong key or corrupted record).
    #[error("decryption failed")]
    DecryptFailed,

    /// Encryption failed (should not happen with a valid key).
    #[error("encryption failed")]
    EncryptFailed,

    /// The decrypted bytes were not valid UTF-8.
    #[error("decrypted payload is not valid UTF-8")]
    InvalidUtf8,
}

/// AEAD box for refresh-token ciphertext.
pub struct CryptoBox {
    cipher: Aes256Gcm,
    derived: bool,
}

impl CryptoBox {
    /// Build a box from an explicit base64url key, falling back to a
    /// derived development key when the configuration is absent or invalid.
    ///
    /// `fallback_seed` should be machine-bound material (admin token, db
    /// path) so the derived key is stable per deployment.
    pub fn from_config(explicit_key_b64: Option<&str>, fallback_seed: &str) -> Self {
        if let Some(raw) = explicit_key_b64 {
            if let Some(key) = decode_key(raw) {
                return Self {
                    cipher: Aes256Gcm::new(&key),
                    derived: false,
                };
            }
            warn!("TOKEN_ENCRYPTION_KEY is not a valid 32-byte base64url key, falling back to derived key");
        }
        warn!("using derived encryption key; set TOKEN_ENCRYPTION_KEY for production");
        let digest = Sha256::digest(format!("{DERIVED_KEY_SALT}|{fallback_seed}"));
        let key = Key::<Aes256Gcm>::from_slice(digest.as_slice());
        Self {
            cipher: Aes256Gcm::new(key),
            derived: true,
        }
    }

    /// Build a box directly from 32 key bytes (tests, tooling).
    pub fn from_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(bytes)),
            derived: false,
        }
    }

    /// Whether the key was derived rather than explicitly configured.
    pub fn is_derived(&self) -> bool {
        self.derived
    }

    /// Seal a refresh token into `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &str) -> Result<Vec<u8>, CryptoError> {
        let token = plaintext.trim();
        if token.is_empty() {
            return Err(CryptoError::EmptyPlaintext);
        }
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, token.as_bytes())
            .map_err(|_| CryptoError::EncryptFailed)?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(nonce.as_slice());
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Open a sealed blob back into the refresh token.
    pub fn open(&self, blob: &[u8]) -> Result<String, CryptoError> {
        if blob.len() <= NONCE_LEN {
            return Err(CryptoError::TruncatedPayload { len: blob.len() });
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)?;
        String::from_utf8(plain).map_err(|_| CryptoError::InvalidUtf8)
    }
}

/// One-way fingerprint of a refresh token (SHA-256 hex).
///
/// Used for uniqueness and import deduplication; stable across processes.
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.trim().as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn decode_key(raw: &str) -> Option<Key<Aes256Gcm>> {
    let trimmed = raw.trim();
    let decoded = URL_SAFE
        .decode(trimmed)
        .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed))
        .ok()?;
    if decoded.len() != 32 {
        return None;
    }
    Some(*Key::<Aes256Gcm>::from_slice(&decoded))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_box() -> CryptoBox {
        CryptoBox::from_key_bytes(&[7u8; 32])
    }

    #[test]
    fn seal_open_roundtrip() {
        let cb = test_box();
        let blob = cb.seal("1//0refresh-token-material").unwrap();
        assert_eq!(cb.open(&blob).unwrap(), "1//0refresh-token-material");
    }

    #[test]
    fn nonces_are_unique_per_seal() {
        let cb = test_box();
        let a = cb.seal("same-token").unwrap();
        let b = cb.seal("same-token").unwrap();
        assert_ne!(a, b);
        assert_ne!(&a[..NONCE_LEN], &b[..NONCE_LEN]);
    }

    #[test]
    fn blob_layout_is_nonce_then_ciphertext() {
        let cb = test_box();
        let blob = cb.seal("tok").unwrap();
        // nonce (12) + ciphertext (3) + tag (16)
        assert_eq!(blob.len(), NONCE_LEN + 3 + 16);
    }

    #[test]
    fn tampered_blob_fails_authentication() {
        let cb = test_box();
        let mut blob = cb.seal("1//0refresh").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(matches!(cb.open(&blob), Err(CryptoError::DecryptFailed)));
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let blob = test_box().seal("1//0refresh").unwrap();
        let other = CryptoBox::from_key_bytes(&[8u8; 32]);
        assert!(matches!(other.open(&blob), Err(CryptoError::DecryptFailed)));
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let cb = test_box();
        assert!(matches!(
            cb.open(&[0u8; 5]),
            Err(CryptoError::TruncatedPayload { len: 5 })
        ));
    }

    #[test]
    fn empty_plaintext_is_rejected() {
        let cb = test_box();
        assert!(matches!(cb.seal("  "), Err(CryptoError::EmptyPlaintext)));
    }

    #[test]
    fn explicit_key_roundtrips_through_base64url() {
        let key_b64 = URL_SAFE.encode([9u8; 32]);
        let cb = CryptoBox::from_config(Some(&key_b64), "seed");
        assert!(!cb.is_derived());
        let blob = cb.seal("tok").unwrap();
        assert_eq!(cb.open(&blob).unwrap(), "tok");
    }

    #[test]
    fn invalid_key_falls_back_to_derived() {
        let cb = CryptoBox::from_config(Some("too-short"), "seed");
        assert!(cb.is_derived());
    }

    #[test]
    fn derived_key_is_stable_for_same_seed() {
        let a = CryptoBox::from_config(None, "seed");
        let b = CryptoBox::from_config(None, "seed");
        let blob = a.seal("tok").unwrap();
        assert_eq!(b.open(&blob).unwrap(), "tok");
    }

    #[test]
    fn fingerprint_is_stable_and_trimmed() {
        assert_eq!(fingerprint("abc"), fingerprint("  abc  "));
        assert_eq!(fingerprint("abc").len(), 64);
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
    }
}
