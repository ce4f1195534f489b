use reqwest::header::HeaderMap;
use secrecy::{ExposeSecret, SecretString};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use super::{window_millis, MemoryWindowStore, RateLimitDecision, RedisWindowStore, WindowStore};

/// Sliding-window limiter backed by Redis when configured.
///
/// Falls back to a per-process store when no Redis URL is set, the URL is
/// invalid, or the first connection attempt fails. Errors from a connected
/// Redis allow the request.
pub struct SlidingWindowLimiter {
    client: Option<redis::Client>,
    remote: OnceCell<Option<RedisWindowStore>>,
    fallback: MemoryWindowStore,
    fallback_logged: AtomicBool,
}

impl SlidingWindowLimiter {
    pub fn new(redis_url: Option<&SecretString>) -> Self {
        let client = redis_url.and_then(|url| match redis::Client::open(url.expose_secret()) {
            Ok(client) => Some(client),
            Err(e) => {
                // The URL may carry a password; log the error only
                tracing::warn!(error = %e, "Invalid rate limit store URL");
                None
            }
        });
        Self {
            client,
            remote: OnceCell::new(),
            fallback: MemoryWindowStore::new(),
            fallback_logged: AtomicBool::new(false),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    pub async fn evaluate(
        &self,
        key_prefix: &str,
        identifier: &str,
        limit: u32,
        window: Duration,
    ) -> RateLimitDecision {
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.evaluate_at(key_prefix, identifier, limit, window, now_ms)
            .await
    }

    pub async fn evaluate_at(
        &self,
        key_prefix: &str,
        identifier: &str,
        limit: u32,
        window: Duration,
        now_ms: i64,
    ) -> RateLimitDecision {
        let key = format!("{key_prefix}:{identifier}");
        let store: &dyn WindowStore = match self.remote().await {
            Some(remote) => remote,
            None => {
                self.note_fallback();
                &self.fallback
            }
        };

        match store.hit(&key, limit, window_millis(window), now_ms).await {
            Ok(decision) => {
                if !decision.allowed {
                    tracing::debug!(key = %key, retry_after = decision.retry_after_secs, "Rate limited");
                }
                decision
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Rate limit check failed, allowing request");
                RateLimitDecision::allow(limit)
            }
        }
    }

    /// Whether decisions are shared through Redis.
    pub async fn is_distributed(&self) -> bool {
        self.remote().await.is_some()
    }

    async fn remote(&self) -> Option<&RedisWindowStore> {
        let client = self.client.as_ref()?;
        self.remote
            .get_or_init(|| async {
                match RedisWindowStore::connect(client).await {
                    Ok(store) => Some(store),
                    Err(e) => {
                        tracing::warn!(error = %e, "Cannot reach rate limit store");
                        None
                    }
                }
            })
            .await
            .as_ref()
    }

    fn note_fallback(&self) {
        if !self.fallback_logged.swap(true, Ordering::Relaxed) {
            tracing::warn!("Using in-process rate limiting; limits are not shared between processes");
        }
    }
}

/// Per-route limits applied to both the user and the client address.
pub struct RouteLimiter {
    limiter: Arc<SlidingWindowLimiter>,
    requests: u32,
    window: Duration,
}

impl RouteLimiter {
    pub fn new(limiter: Arc<SlidingWindowLimiter>, requests: u32, window: Duration) -> Self {
        Self {
            limiter,
            requests,
            window,
        }
    }

    /// Denies when either the user or the client IP is over the limit.
    ///
    /// Both windows are hit concurrently, so a request one of them denies
    /// still counts against the other one if that one allowed it.
    pub async fn check(&self, route: &str, user_id: i64, headers: &HeaderMap) -> RateLimitDecision {
        let ip = client_ip(headers);
        let user_prefix = format!("rl:{route}:user");
        let ip_prefix = format!("rl:{route}:ip");
        let user_id = user_id.to_string();

        let (by_user, by_ip) = tokio::join!(
            self.limiter
                .evaluate(&user_prefix, &user_id, self.requests, self.window),
            self.limiter
                .evaluate(&ip_prefix, &ip, self.requests, self.window),
        );
        by_user.combine(by_ip)
    }
}

/// Client address from proxy headers: the first `x-forwarded-for` entry,
/// else `x-real-ip`, else `"unknown"`.
pub fn client_ip(headers: &HeaderMap) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse::<IpAddr>().ok());
    let real = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<IpAddr>().ok())
    };

    forwarded
        .or_else(real)
        .map_or_else(|| "unknown".to_owned(), |ip| ip.to_string())
}
