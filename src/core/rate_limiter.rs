//! Inbound request rate limiting, per user token.
//!
//! Quotas meter tokens; this meters raw request throughput using the token
//! bucket algorithm via the governor crate. One limiter per user token,
//! created lazily on first sight. A configured rate of 0 disables the
//! limiter entirely.

use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::sync::Arc;

use super::error::ProxyError;

type LimiterInstance = Arc<GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

pub struct UserRateLimiter {
    limiters: DashMap<String, LimiterInstance>,
    requests_per_minute: u32,
}

impl UserRateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            limiters: DashMap::new(),
            requests_per_minute,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.requests_per_minute > 0
    }

    /// Check whether a request from this user token is admitted.
    pub fn check(&self, token: &str) -> Result<(), ProxyError> {
        if !self.is_enabled() {
            return Ok(());
        }

        let limiter = self
            .limiters
            .entry(token.to_string())
            .or_insert_with(|| {
                let quota = Quota::per_minute(
                    NonZeroU32::new(self.requests_per_minute).unwrap_or(nonzero!(1u32)),
                );
                Arc::new(GovernorRateLimiter::direct(quota))
            })
            .clone();

        limiter.check().map_err(|_| {
            ProxyError::RateLimited(format!(
                "This user token is limited to {} requests per minute",
                self.requests_per_minute
            ))
        })
    }

    /// Drop a user's limiter (e.g. after the user record is deleted).
    pub fn remove(&self, token: &str) {
        self.limiters.remove(token);
    }
}
