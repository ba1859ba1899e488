//! Opaque secret primitives.
//!
//! Key hashing and encryption-at-rest are owned by the admin collaborator; this
//! module only exposes the seams the gateway needs: `hash` for client-key
//! comparison, `decrypt` for upstream secrets, and masked rendering for list
//! views.

use sha2::{Digest, Sha256};

use crate::core::error::{AppError, Result};

/// Sentinel shown when a stored secret cannot be decrypted or is too short to
/// mask meaningfully.
pub const MASK_SENTINEL: &str = "<unavailable>";

/// Hash an API key for storage/comparison.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Verify a presented key against a stored hash.
pub fn verify_key(presented: &str, stored_hash: &str) -> bool {
    hash_key(presented) == stored_hash
}

/// Decrypt/encrypt seam for secrets at rest. The production implementation
/// lives with the admin collaborator; the gateway only requires the contract.
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String>;
    fn decrypt(&self, token: &str) -> Result<String>;
}

/// Pass-through cipher for deployments where the directory already hands the
/// gateway decrypted secrets, and for tests.
#[derive(Debug, Default)]
pub struct PlainCipher;

impl SecretCipher for PlainCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        Ok(plaintext.to_string())
    }

    fn decrypt(&self, token: &str) -> Result<String> {
        Ok(token.to_string())
    }
}

/// Decrypt an upstream secret, surfacing failures distinctly per operation.
pub fn decrypt_secret(cipher: &dyn SecretCipher, token: &str, context: &str) -> Result<String> {
    cipher.decrypt(token).map_err(|err| {
        tracing::error!(context = %context, error = %err, "Secret decryption failed");
        AppError::SecretDecryption {
            context: context.to_string(),
        }
    })
}

/// Mask a secret for list/debug display: first four characters plus ellipsis.
///
/// Falls back to the sentinel rather than aborting the listing when the secret
/// is unavailable or too short.
pub fn mask_secret(secret: Option<&str>) -> String {
    match secret {
        Some(s) if s.len() > 8 => format!("{}…", &s[..4.min(s.len())]),
        Some(_) | None => MASK_SENTINEL.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_key_deterministic() {
        assert_eq!(hash_key("sk-test"), hash_key("sk-test"));
        assert_ne!(hash_key("sk-test"), hash_key("sk-other"));
        assert_eq!(hash_key("sk-test").len(), 64);
    }

    #[test]
    fn test_verify_key() {
        let stored = hash_key("sk-test");
        assert!(verify_key("sk-test", &stored));
        assert!(!verify_key("sk-wrong", &stored));
    }

    #[test]
    fn test_plain_cipher_round_trip() {
        let cipher = PlainCipher;
        let token = cipher.encrypt("sk-secret").unwrap();
        assert_eq!(cipher.decrypt(&token).unwrap(), "sk-secret");
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret(Some("sk-abcdefghij")), "sk-a…");
        assert_eq!(mask_secret(Some("short")), MASK_SENTINEL);
        assert_eq!(mask_secret(None), MASK_SENTINEL);
    }

    #[test]
    fn test_decrypt_secret_failure_is_distinct() {
        struct FailingCipher;
        impl SecretCipher for FailingCipher {
            fn encrypt(&self, _: &str) -> Result<String> {
                Err(AppError::Internal("nope".into()))
            }
            fn decrypt(&self, _: &str) -> Result<String> {
                Err(AppError::Internal("nope".into()))
            }
        }

        let err = decrypt_secret(&FailingCipher, "token", "upstream 42").unwrap_err();
        assert!(matches!(err, AppError::SecretDecryption { .. }));
    }
}
