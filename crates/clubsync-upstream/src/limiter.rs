use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota};
use tokio_util::sync::CancellationToken;

use crate::UpstreamError;

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            refill_every: Duration::from_millis(500),
        }
    }
}

/// Token bucket shared by every outbound upstream request. A zero refill
/// interval disables throttling.
pub struct RateLimiter {
    config: TokenBucketConfig,
    inner: Option<DefaultDirectRateLimiter>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("capacity", &self.config.capacity)
            .field("refill_every", &self.config.refill_every)
            .finish()
    }
}

impl RateLimiter {
    pub fn new(config: TokenBucketConfig) -> Self {
        let burst = NonZeroU32::new(config.capacity).unwrap_or(NonZeroU32::MIN);
        let inner = Quota::with_period(config.refill_every)
            .map(|quota| governor::RateLimiter::direct(quota.allow_burst(burst)));
        Self { config, inner }
    }

    /// Take one token, sleeping until one is available.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), UpstreamError> {
        if cancel.is_cancelled() {
            return Err(UpstreamError::Cancelled);
        }
        let Some(limiter) = &self.inner else {
            return Ok(());
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(UpstreamError::Cancelled),
            _ = limiter.until_ready() => Ok(()),
        }
    }
}
