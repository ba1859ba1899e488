//! Per-client-key rate limiting.
//!
//! Token-bucket limiting via the governor crate; each client API key can carry
//! an independent requests-per-second quota.

use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::core::error::AppError;

type RateLimiterInstance = Arc<GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// Rate limit settings for one client key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub requests_per_second: u32,
    pub burst_size: u32,
}

/// Rate limiter for managing per-key request limits.
pub struct RateLimiter {
    /// Map of key hash -> rate limiter instance
    limiters: Arc<DashMap<String, RateLimiterInstance>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            limiters: Arc::new(DashMap::new()),
        }
    }

    /// Register a key hash with rate limiting. Replaces any existing quota.
    pub fn register_key(&self, key_hash: &str, config: &RateLimitConfig) {
        let quota = Quota::per_second(
            NonZeroU32::new(config.requests_per_second).unwrap_or(nonzero!(1u32)),
        )
        .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(nonzero!(10u32)));

        let limiter = Arc::new(GovernorRateLimiter::direct(quota));
        self.limiters.insert(key_hash.to_string(), limiter);
    }

    /// Check whether a request is allowed for the given key hash.
    ///
    /// Keys with no registered quota are not limited.
    pub fn check_rate_limit(&self, key_hash: &str) -> Result<(), AppError> {
        if let Some(limiter) = self.limiters.get(key_hash) {
            match limiter.check() {
                Ok(_) => Ok(()),
                Err(_) => {
                    tracing::warn!(
                        key_hash_prefix = &key_hash[..key_hash.len().min(8)],
                        "Rate limit exceeded"
                    );
                    Err(AppError::RateLimitExceeded(
                        "Rate limit exceeded for key".to_string(),
                    ))
                }
            }
        } else {
            Ok(())
        }
    }

    /// Remove keys no longer present in the directory snapshot.
    pub fn retain_keys(&self, live_hashes: &std::collections::HashSet<String>) {
        let stale: Vec<String> = self
            .limiters
            .iter()
            .filter(|entry| !live_hashes.contains(entry.key().as_str()))
            .map(|entry| entry.key().clone())
            .collect();

        for key in &stale {
            self.limiters.remove(key);
        }

        if !stale.is_empty() {
            tracing::info!(removed_count = stale.len(), "Removed stale rate limits");
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
