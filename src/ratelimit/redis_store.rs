use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};

use super::{RateLimitDecision, StoreUnavailable, WindowStore};

/// Trim, count, conditionally record and report the oldest stamp in one
/// round trip. Returns `{allowed, remaining, retry_after_ms}`.
const SLIDING_WINDOW_LUA: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)

if count < limit then
  redis.call('ZADD', key, now, member)
  redis.call('PEXPIRE', key, window)
  return {1, limit - count - 1, 0}
end

local retry = window
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
  retry = tonumber(oldest[2]) + window - now
end
return {0, 0, retry}
"#;

/// Window store shared by every process pointing at the same Redis.
#[derive(Clone)]
pub struct RedisWindowStore {
    conn: MultiplexedConnection,
    script: Script,
}

impl RedisWindowStore {
    pub async fn connect(client: &Client) -> Result<Self, StoreUnavailable> {
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            script: Script::new(SLIDING_WINDOW_LUA),
        })
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn hit(
        &self,
        key: &str,
        limit: u32,
        window_ms: i64,
        now_ms: i64,
    ) -> Result<RateLimitDecision, StoreUnavailable> {
        // Members must be unique or same-millisecond requests collapse
        let member = format!("{now_ms}-{:016x}", rand::random::<u64>());
        let mut conn = self.conn.clone();
        let (allowed, remaining, retry_ms): (i64, i64, i64) = self
            .script
            .key(key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        if allowed == 1 {
            Ok(RateLimitDecision::allow(
                u32::try_from(remaining.max(0)).unwrap_or(u32::MAX),
            ))
        } else {
            Ok(RateLimitDecision::deny(retry_ms))
        }
    }
}
