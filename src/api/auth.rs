//! Client API key authentication.
//!
//! Accepts both credential schemes the gateway fronts (`x-api-key` and
//! `Authorization: Bearer`); keys are compared by hash only, and hashing is
//! the admin collaborator's opaque primitive.

use axum::http::HeaderMap;

use crate::core::database::ApiKeyRow;
use crate::core::error::{AppError, Result};
use crate::core::header_policy::extract_client_key;
use crate::core::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::core::secrets::hash_key;

/// One authenticated client credential.
#[derive(Debug, Clone)]
pub struct ClientKey {
    pub id: String,
    pub name: String,
    pub key_hash: String,
    pub enabled: bool,
    pub rate_limit: Option<RateLimitConfig>,
}

impl ClientKey {
    pub fn from_row(row: ApiKeyRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            key_hash: row.key_hash,
            enabled: row.is_enabled,
            rate_limit: row.rate_limit.map(|rps| RateLimitConfig {
                requests_per_second: rps.max(1) as u32,
                burst_size: (rps.max(1) as u32).saturating_mul(2),
            }),
        }
    }
}

/// Verify the request's API key against the configured client keys.
///
/// An empty key directory means authentication is not configured; requests
/// pass through anonymously.
pub fn verify_auth(
    headers: &HeaderMap,
    keys: &[ClientKey],
    rate_limiter: &RateLimiter,
) -> Result<Option<ClientKey>> {
    if keys.is_empty() {
        return Ok(None);
    }

    let provided = extract_client_key(headers).ok_or(AppError::Unauthorized)?;
    let provided_hash = hash_key(provided);

    for key in keys {
        if key.enabled && key.key_hash == provided_hash {
            rate_limiter.check_rate_limit(&key.key_hash)?;
            tracing::debug!(key_name = %key.name, "Request authenticated");
            return Ok(Some(key.clone()));
        }
    }

    Err(AppError::Unauthorized)
}

/// The key name recorded on logs and metrics.
pub fn key_name(key: &Option<ClientKey>) -> String {
    key.as_ref()
        .map(|k| k.name.clone())
        .unwrap_or_else(|| "anonymous".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn key(name: &str, plaintext: &str, enabled: bool) -> ClientKey {
        ClientKey {
            id: format!("key-{}", name),
            name: name.to_string(),
            key_hash: hash_key(plaintext),
            enabled,
            rate_limit: None,
        }
    }

    fn bearer(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {}", value)).unwrap(),
        );
        headers
    }

    #[test]
    fn test_bearer_auth_accepted() {
        let keys = vec![key("alice", "sk-alice", true)];
        let limiter = RateLimiter::new();
        let result = verify_auth(&bearer("sk-alice"), &keys, &limiter).unwrap();
        assert_eq!(result.unwrap().name, "alice");
    }

    #[test]
    fn test_x_api_key_auth_accepted() {
        let keys = vec![key("bob", "sk-bob", true)];
        let limiter = RateLimiter::new();
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-bob"));
        let result = verify_auth(&headers, &keys, &limiter).unwrap();
        assert_eq!(result.unwrap().name, "bob");
    }

    #[test]
    fn test_wrong_key_rejected() {
        let keys = vec![key("alice", "sk-alice", true)];
        let limiter = RateLimiter::new();
        assert!(matches!(
            verify_auth(&bearer("sk-wrong"), &keys, &limiter),
            Err(AppError::Unauthorized)
        ));
    }

    #[test]
    fn test_disabled_key_rejected() {
        let keys = vec![key("alice", "sk-alice", false)];
        let limiter = RateLimiter::new();
        assert!(matches!(
            verify_auth(&bearer("sk-alice"), &keys, &limiter),
            Err(AppError::Unauthorized)
        ));
    }

    #[test]
    fn test_missing_key_rejected() {
        let keys = vec![key("alice", "sk-alice", true)];
        let limiter = RateLimiter::new();
        assert!(matches!(
            verify_auth(&HeaderMap::new(), &keys, &limiter),
            Err(AppError::Unauthorized)
        ));
    }

    #[test]
    fn test_empty_directory_is_anonymous() {
        let limiter = RateLimiter::new();
        let result = verify_auth(&HeaderMap::new(), &[], &limiter).unwrap();
        assert!(result.is_none());
        assert_eq!(key_name(&result), "anonymous");
    }

    #[test]
    fn test_rate_limited_key() {
        let k = key("alice", "sk-alice", true);
        let limiter = RateLimiter::new();
        limiter.register_key(
            &k.key_hash,
            &RateLimitConfig {
                requests_per_second: 1,
                burst_size: 1,
            },
        );
        let keys = vec![k];

        assert!(verify_auth(&bearer("sk-alice"), &keys, &limiter).is_ok());
        assert!(matches!(
            verify_auth(&bearer("sk-alice"), &keys, &limiter),
            Err(AppError::RateLimitExceeded(_))
        ));
    }
}
