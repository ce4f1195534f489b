//! Sliding-window request throttling.
//!
//! - [`limiter`] - Limiter with a shared Redis store and an in-process fallback
//! - [`memory`] - In-process window store
//! - [`redis_store`] - Atomic window check as one Redis script call
//!
//! A request is allowed when fewer than `limit` earlier requests fall inside
//! the trailing window. Store failures allow the request.

pub mod limiter;
pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub use limiter::{client_ip, RouteLimiter, SlidingWindowLimiter};
pub use memory::MemoryWindowStore;
pub use redis_store::RedisWindowStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Seconds until a slot frees up; 0 when allowed
    pub retry_after_secs: u64,
}

impl RateLimitDecision {
    pub fn allow(remaining: u32) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after_secs: 0,
        }
    }

    /// Denied decision. Rounds up and never reports less than one second.
    pub fn deny(retry_after_ms: i64) -> Self {
        let secs = (retry_after_ms.max(0) as u64).div_ceil(1000).max(1);
        Self {
            allowed: false,
            remaining: 0,
            retry_after_secs: secs,
        }
    }

    /// The stricter of two decisions.
    pub fn combine(self, other: Self) -> Self {
        Self {
            allowed: self.allowed && other.allowed,
            remaining: self.remaining.min(other.remaining),
            retry_after_secs: self.retry_after_secs.max(other.retry_after_secs),
        }
    }
}

#[derive(Debug, Error)]
#[error("rate limit store unavailable: {0}")]
pub struct StoreUnavailable(String);

impl From<redis::RedisError> for StoreUnavailable {
    fn from(err: redis::RedisError) -> Self {
        StoreUnavailable(err.to_string())
    }
}

/// Records one request against `key` if the window has room.
#[async_trait]
pub trait WindowStore: Send + Sync {
    async fn hit(
        &self,
        key: &str,
        limit: u32,
        window_ms: i64,
        now_ms: i64,
    ) -> Result<RateLimitDecision, StoreUnavailable>;
}

pub(crate) fn window_millis(window: Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX).max(1)
}
