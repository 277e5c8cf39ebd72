use async_trait::async_trait;
use redis::Script;
use redis_utils::SharedConnectionManager;
use std::time::Duration;

use super::{RateLimitDecision, RateLimitError, RateLimiterBackend};

/// Increment and arm the TTL in one round-trip. A key left without a TTL
/// (for example by an interrupted earlier call) is re-armed.
const CHECK_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if current == 1 or ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {current, ttl}
"#;

const RELEASE_SCRIPT: &str = r#"
local current = redis.call('DECR', KEYS[1])
if current <= 0 then
  redis.call('DEL', KEYS[1])
end
return current
"#;

/// Distributed fixed-window counters in Redis.
pub struct RedisRateLimitBackend {
    redis: SharedConnectionManager,
    check_script: Script,
    release_script: Script,
}

impl RedisRateLimitBackend {
    pub fn new(redis: SharedConnectionManager) -> Self {
        Self {
            redis,
            check_script: Script::new(CHECK_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }
}

#[async_trait]
impl RateLimiterBackend for RedisRateLimitBackend {
    async fn check_limit(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let window_ms = window.as_millis().max(1) as u64;
        let mut conn = self.redis.lock().await.clone();

        let (count, ttl_ms): (i64, i64) = self
            .check_script
            .key(key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RateLimitError::Backend(e.to_string()))?;

        let reset_after = if ttl_ms > 0 {
            Duration::from_millis(ttl_ms as u64)
        } else {
            window
        };

        Ok(RateLimitDecision::from_count(
            count.max(0) as u64,
            limit,
            reset_after,
        ))
    }

    async fn release(&self, key: &str) -> Result<(), RateLimitError> {
        let mut conn = self.redis.lock().await.clone();
        let _: i64 = self
            .release_script
            .key(key)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RateLimitError::Backend(e.to_string()))?;
        Ok(())
    }
}
