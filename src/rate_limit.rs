use chrono::Utc;
use std::sync::Arc;

use crate::bus::EventBus;
use crate::cache::RedisGateway;
use crate::models::{EventType, RateLimitEvent};

/// Sliding-window rate limiter over Redis sorted sets.
///
/// Fails open: with Redis unavailable or limiting disabled every request is
/// allowed. A denied request publishes `traffic.request_degraded`.
pub struct RateLimiter {
    gateway: Option<RedisGateway>,
    bus: Arc<dyn EventBus>,
    enabled: bool,
}

impl RateLimiter {
    pub fn new(gateway: Option<RedisGateway>, bus: Arc<dyn EventBus>, enabled: bool) -> Self {
        Self {
            gateway,
            bus,
            enabled,
        }
    }

    /// True when the request under `key` fits inside the window
    pub async fn is_allowed(&self, key: &str, limit: u64, window_secs: u64) -> bool {
        if !self.enabled {
            return true;
        }
        let Some(gateway) = &self.gateway else {
            return true;
        };

        let now = Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        let window_start = now - window_secs as f64;
        let redis_key = format!("rate_limit:{}", key);

        let mut con = gateway.conn();
        let result: Result<(i64, u64, i64, i64), redis::RedisError> = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&redis_key)
            .arg(0)
            .arg(window_start)
            .cmd("ZCARD")
            .arg(&redis_key)
            .cmd("ZADD")
            .arg(&redis_key)
            .arg(now)
            .arg(now.to_string())
            .cmd("EXPIRE")
            .arg(&redis_key)
            .arg(window_secs)
            .query_async(&mut con)
            .await;

        let current_count = match result {
            Ok((_, count, _, _)) => count,
            Err(e) => {
                tracing::error!("rate limiter redis failure, failing open: {}", e);
                return true;
            }
        };

        let allowed = current_count < limit;
        if !allowed {
            tracing::warn!("rate limit exceeded for {}", key);
            let payload = RateLimitEvent {
                event_id: format!("limit_{}_{}", key, now as i64),
                key: key.to_string(),
                limit,
                window: window_secs,
                current_count,
                reason: "Rate limit exceeded".to_string(),
            };
            // Fire and forget
            let bus = self.bus.clone();
            tokio::spawn(async move {
                if let Ok(value) = serde_json::to_value(&payload) {
                    if let Err(e) = bus.publish(EventType::RequestDegraded.as_str(), value).await {
                        tracing::error!("failed to publish degradation event: {}", e);
                    }
                }
            });
        }

        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryEventBus;

    #[tokio::test]
    async fn disabled_limiter_always_allows() {
        let limiter = RateLimiter::new(None, Arc::new(MemoryEventBus::new()), false);
        for _ in 0..100 {
            assert!(limiter.is_allowed("tenant-1", 1, 1).await);
        }
    }

    #[tokio::test]
    async fn missing_redis_fails_open() {
        let limiter = RateLimiter::new(None, Arc::new(MemoryEventBus::new()), true);
        assert!(limiter.is_allowed("tenant-1", 0, 1).await);
    }
}
