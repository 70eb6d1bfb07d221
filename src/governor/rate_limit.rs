//! Fixed-window request counting per caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::warn;

use crate::error::{QueryError, SharedError};
use crate::redis_backend::RedisBackend;
use crate::routes::metrics::Metrics;

/// State of a window after counting one hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u64,
    pub reset_in_ms: u64,
}

#[async_trait]
pub trait WindowTable: Send + Sync {
    /// Count one hit against `key`, opening a new window when none is live.
    async fn hit(&self, key: &str, window: Duration) -> Result<WindowCount, SharedError>;
}

/// Single-process windows keyed by caller.
#[derive(Default)]
pub struct LocalWindows {
    windows: Mutex<HashMap<String, (u64, Instant)>>,
}

impl LocalWindows {
    pub fn new() -> Self {
        Self::default()
    }

    fn hit_local(&self, key: &str, window: Duration) -> WindowCount {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        windows.retain(|_, (_, reset_at)| *reset_at > now);

        let (count, reset_at) = windows
            .entry(key.to_string())
            .or_insert((0, now + window));
        *count += 1;

        WindowCount {
            count: *count,
            reset_in_ms: reset_at.saturating_duration_since(now).as_millis() as u64,
        }
    }
}

#[async_trait]
impl WindowTable for LocalWindows {
    async fn hit(&self, key: &str, window: Duration) -> Result<WindowCount, SharedError> {
        Ok(self.hit_local(key, window))
    }
}

/// `INCR` plus `PEXPIRE` on the first hit of a window.
pub struct RedisWindows {
    redis: RedisBackend,
}

impl RedisWindows {
    pub fn new(redis: RedisBackend) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl WindowTable for RedisWindows {
    async fn hit(&self, key: &str, window: Duration) -> Result<WindowCount, SharedError> {
        let count = self.redis.incr(key).await?;
        if count == 1 {
            self.redis.pexpire(key, window).await?;
        }
        let reset_in_ms = match self.redis.pttl(key).await? {
            Some(ms) => ms,
            None => {
                // an earlier PEXPIRE was lost; never let the window live forever
                self.redis.pexpire(key, window).await?;
                window.as_millis() as u64
            }
        };
        Ok(WindowCount {
            count: count.max(0) as u64,
            reset_in_ms,
        })
    }
}

/// At most `max` calls per `window` for one caller key.
pub struct RateLimiter {
    shared: Option<Arc<dyn WindowTable>>,
    local: LocalWindows,
    max: u64,
    window: Duration,
    metrics: Arc<Metrics>,
}

impl RateLimiter {
    pub fn new(
        shared: Option<Arc<dyn WindowTable>>,
        max: u64,
        window: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            shared,
            local: LocalWindows::new(),
            max,
            window,
            metrics,
        }
    }

    /// Count the call and fail with `RateLimited` once the window is spent.
    pub async fn assert_within_limit(&self, key: &str) -> Result<(), QueryError> {
        let state = match &self.shared {
            Some(shared) => match shared.hit(key, self.window).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(error = %e, key, "Shared rate limit table unavailable, counting locally");
                    self.metrics.inc_governor_fallbacks();
                    self.local.hit_local(key, self.window)
                }
            },
            None => self.local.hit_local(key, self.window),
        };

        if state.count > self.max {
            self.metrics.inc_rate_limited();
            return Err(QueryError::RateLimited {
                key: key.to_string(),
                retry_after_ms: state.reset_in_ms,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u64) -> RateLimiter {
        RateLimiter::new(None, max, Duration::from_secs(60), Arc::new(Metrics::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn sixth_call_in_window_is_rejected() {
        let limiter = limiter(5);
        for _ in 0..5 {
            limiter.assert_within_limit("t:u:1").await.unwrap();
        }

        let err = limiter.assert_within_limit("t:u:1").await.unwrap_err();
        match err {
            QueryError::RateLimited { retry_after_ms, .. } => {
                assert!(retry_after_ms > 0 && retry_after_ms <= 60_000);
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_after_expiry() {
        let limiter = limiter(5);
        for _ in 0..5 {
            limiter.assert_within_limit("k").await.unwrap();
        }
        assert!(limiter.assert_within_limit("k").await.is_err());

        tokio::time::advance(Duration::from_secs(61)).await;
        limiter.assert_within_limit("k").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn callers_are_counted_separately() {
        let limiter = limiter(1);
        limiter.assert_within_limit("a").await.unwrap();
        limiter.assert_within_limit("b").await.unwrap();
        assert!(limiter.assert_within_limit("a").await.is_err());
    }
}
